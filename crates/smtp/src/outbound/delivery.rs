/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use auth::tlsrpt::TlsRptRecord;
use smtp_proto::MAIL_REQUIRETLS;

use crate::{
    core::SMTP,
    queue::{
        now, DeliveryAttempt, Error, ErrorDetails, Event, OnHold, Schedule, Status, WorkerResult,
    },
    reporting::{FailureDetails, PolicyType, ResultType, TlsEvent},
};

use super::{
    client::SmtpClient,
    dane::verify::TlsaVerify,
    lookup::ToNextHop,
    session::DeliveryParams,
    NextHop, TlsStrategy,
};

impl DeliveryAttempt {
    /// Runs one delivery pass over every due recipient domain on its own
    /// task and reports the outcome back to the queue manager.
    pub fn try_deliver(mut self, core: Arc<SMTP>) {
        tokio::spawn(async move {
            // Mark expired domains terminal before anything else.
            let has_pending = self.handle_expired();

            // Send any due delay/failure notifications.
            core.send_dsn(&mut self.message, &self.span).await;

            if !has_pending {
                // Every recipient reached a terminal state.
                self.message.remove().await;
                tracing::info!(parent: &self.span,
                    context = "queue",
                    event = "completed",
                    "Delivery completed.");
                notify_manager(&core, WorkerResult::Done).await;
                return;
            }
            let due = self.message.next_delivery_event();
            if due > now() {
                self.message.save_changes().await;
                notify_manager(
                    &core,
                    WorkerResult::Retry(Schedule {
                        due,
                        inner: self.message,
                    }),
                )
                .await;
                return;
            }

            let mut on_hold_limiters = Vec::new();
            let mut domains = std::mem::take(&mut self.message.domains);
            let mut recipients = std::mem::take(&mut self.message.recipients);
            let queue_config = &core.core.queue;

            'next_domain: for (domain_idx, domain) in domains.iter_mut().enumerate() {
                if !matches!(
                    &domain.status,
                    Status::Scheduled | Status::TemporaryFailure(_)
                ) || domain.retry.due > now()
                {
                    continue;
                }

                let span = tracing::info_span!(parent: &self.span,
                    "attempt",
                    domain = domain.domain.as_str(),
                    attempt_number = domain.retry.inner,
                );

                // Per-domain concurrency.
                let _domain_slot = match core.queue.throttle.acquire(&domain.domain) {
                    Ok(slot) => slot,
                    Err(limiter) => {
                        tracing::debug!(parent: &span,
                            context = "throttle",
                            event = "concurrency-limited",
                            domain = domain.domain.as_str());
                        on_hold_limiters.push(limiter);
                        continue 'next_domain;
                    }
                };

                // Transport selection: a named relay or direct MX.
                let relay = self
                    .message
                    .transport
                    .as_ref()
                    .and_then(|name| queue_config.transports.get(name));
                let (mut remote_hosts, is_direct) = match relay {
                    Some(relay) => (vec![NextHop::Relay(relay)], false),
                    None => (Vec::new(), true),
                };

                // TLS-RPT accumulation applies to direct SMTP only.
                let tls_report = if is_direct {
                    match core
                        .core
                        .resolver
                        .txt_lookup(&format!("_smtp._tls.{}", domain.domain))
                        .await
                        .map(|records| TlsRptRecord::from_txt(&records))
                    {
                        Ok(Ok(Some(record))) => {
                            tracing::debug!(parent: &span,
                                context = "tlsrpt",
                                event = "record-fetched",
                                rua = ?record.rua);
                            Some(record)
                        }
                        _ => None,
                    }
                } else {
                    None
                };

                let tls_strategy = TlsStrategy {
                    dane: queue_config.tls.dane,
                    mta_sts: queue_config.tls.mta_sts,
                    tls: queue_config.tls.start,
                };

                // MTA-STS policy for the recipient domain.
                let mta_sts_policy = if tls_strategy.try_mta_sts() && is_direct {
                    match core
                        .lookup_mta_sts_policy(&domain.domain, queue_config.timeouts.mta_sts)
                        .await
                    {
                        Ok(policy) => {
                            tracing::debug!(parent: &span,
                                context = "sts",
                                event = "policy-fetched",
                                policy = ?policy);
                            Some(policy)
                        }
                        Err(err) => {
                            if let Some(tls_report) = &tls_report {
                                if !matches!(
                                    &err,
                                    super::mta_sts::Error::Dns(auth::DnsError::NotFound)
                                ) {
                                    schedule_tls_event(
                                        &core,
                                        &domain.domain,
                                        PolicyType::Sts(None),
                                        FailureDetails::new(ResultType::from(&err))
                                            .with_failure_reason_code(err.to_string())
                                            .into(),
                                        tls_report,
                                    )
                                    .await;
                                }
                            }

                            if tls_strategy.is_mta_sts_required() {
                                tracing::info!(parent: &span,
                                    context = "sts",
                                    event = "policy-fetch-failure",
                                    "Failed to retrieve MTA-STS policy: {err}");
                                domain.set_status(Status::from(err), queue_config);
                                continue 'next_domain;
                            }
                            None
                        }
                    }
                } else {
                    None
                };

                // Resolve MX hosts.
                let mx_list;
                if is_direct {
                    mx_list = match core.core.resolver.mx_lookup(&domain.domain).await {
                        Ok(mx) => mx,
                        Err(auth::DnsError::NotFound) => {
                            // No MX record: fall back to the implicit MX.
                            Arc::new(common::resolver::DnsRecords {
                                records: Vec::new(),
                                authentic: false,
                            })
                        }
                        Err(err) => {
                            tracing::info!(parent: &span,
                                context = "dns",
                                event = "mx-lookup-failed",
                                reason = %err);
                            domain.set_status(Status::from(err), queue_config);
                            continue 'next_domain;
                        }
                    };

                    if let Some(hosts) = mx_list
                        .records
                        .to_remote_hosts(&domain.domain, queue_config.max_mx)
                    {
                        remote_hosts = hosts;
                    } else {
                        tracing::info!(parent: &span,
                            context = "dns",
                            event = "null-mx",
                            "Domain does not accept messages (null MX)");
                        domain.set_status(Status::PermanentFailure(Error::NullMx), queue_config);
                        continue 'next_domain;
                    }
                }

                // Try each candidate host.
                let mut last_status = Status::Scheduled;
                'next_host: for remote_host in &remote_hosts {
                    let mx_hostname = remote_host.hostname().to_string();

                    // MTA-STS host authorization.
                    if let Some(mta_sts_policy) = &mta_sts_policy {
                        if !mta_sts_policy.verify(&mx_hostname) {
                            if let Some(tls_report) = &tls_report {
                                schedule_tls_event(
                                    &core,
                                    &domain.domain,
                                    PolicyType::Sts(Some(mta_sts_policy.clone())),
                                    FailureDetails::new(ResultType::ValidationFailure)
                                        .with_receiving_mx_hostname(mx_hostname.clone())
                                        .with_failure_reason_code("MX not authorized by policy.")
                                        .into(),
                                    tls_report,
                                )
                                .await;
                            }
                            tracing::info!(parent: &span,
                                context = "sts",
                                event = "policy-error",
                                mx = mx_hostname.as_str(),
                                "MX not authorized by policy.");
                            if mta_sts_policy.enforce() {
                                // The policy may be stale; keep retrying
                                // until the message expires.
                                last_status = Status::TemporaryFailure(Error::MtaStsError(
                                    format!("MX {mx_hostname:?} not authorized by policy."),
                                ));
                                continue 'next_host;
                            }
                        }
                    }

                    // Candidate addresses.
                    let resolved = match core
                        .resolve_host(remote_host, queue_config.max_multihomed)
                        .await
                    {
                        Ok(resolved) => resolved,
                        Err(status) => {
                            tracing::info!(parent: &span,
                                context = "dns",
                                event = "ip-lookup-failed",
                                mx = mx_hostname.as_str(),
                                status = %status);
                            last_status = status;
                            continue 'next_host;
                        }
                    };

                    // DANE policy; only authentic TLSA answers apply.
                    let dane_policy = if tls_strategy.try_dane() && is_direct {
                        match core
                            .core
                            .resolver
                            .tlsa_lookup(&format!("_25._tcp.{mx_hostname}"))
                            .await
                        {
                            Ok(Some(tlsa)) if tlsa.has_end_entities => {
                                tracing::debug!(parent: &span,
                                    context = "dane",
                                    event = "record-fetched",
                                    mx = mx_hostname.as_str(),
                                    record = ?tlsa);
                                Some(tlsa)
                            }
                            Ok(Some(tlsa)) => {
                                tracing::info!(parent: &span,
                                    context = "dane",
                                    event = "no-usable-tlsa",
                                    mx = mx_hostname.as_str(),
                                    "No valid TLSA records were found.");
                                if let Some(tls_report) = &tls_report {
                                    schedule_tls_event(
                                        &core,
                                        &domain.domain,
                                        PolicyType::Tlsa(Some(tlsa.clone())),
                                        FailureDetails::new(ResultType::TlsaInvalid)
                                            .with_receiving_mx_hostname(mx_hostname.clone())
                                            .with_failure_reason_code("Invalid TLSA record.")
                                            .into(),
                                        tls_report,
                                    )
                                    .await;
                                }
                                if tls_strategy.is_dane_required() {
                                    last_status =
                                        Status::PermanentFailure(Error::DaneError(ErrorDetails {
                                            entity: mx_hostname.clone(),
                                            details: "No valid TLSA records were found"
                                                .to_string(),
                                        }));
                                    continue 'next_host;
                                }
                                None
                            }
                            Ok(None) | Err(auth::DnsError::NotFound) => {
                                if tls_strategy.is_dane_required() {
                                    if let Some(tls_report) = &tls_report {
                                        schedule_tls_event(
                                            &core,
                                            &domain.domain,
                                            PolicyType::Tlsa(None),
                                            FailureDetails::new(ResultType::DaneRequired)
                                                .with_receiving_mx_hostname(mx_hostname.clone())
                                                .with_failure_reason_code(
                                                    "No TLSA DNSSEC records found.",
                                                )
                                                .into(),
                                            tls_report,
                                        )
                                        .await;
                                    }
                                    tracing::info!(parent: &span,
                                        context = "dane",
                                        event = "tlsa-missing",
                                        mx = mx_hostname.as_str(),
                                        "No TLSA DNSSEC records found.");
                                    last_status =
                                        Status::PermanentFailure(Error::DaneError(ErrorDetails {
                                            entity: mx_hostname.clone(),
                                            details: "No TLSA DNSSEC records found".to_string(),
                                        }));
                                    continue 'next_host;
                                }
                                None
                            }
                            Err(err) => {
                                if tls_strategy.is_dane_required() {
                                    last_status = Status::from(err);
                                    continue 'next_host;
                                }
                                None
                            }
                        }
                    } else {
                        None
                    };

                    // REQUIRETLS and policy presence tighten the strategy.
                    let tls_required = tls_strategy.is_tls_required()
                        || self.message.has_flag(MAIL_REQUIRETLS)
                        || mta_sts_policy.as_ref().map_or(false, |p| p.enforce())
                        || dane_policy.is_some();

                    'next_ip: for remote_ip in &resolved.remote_ips {
                        let remote_addr = std::net::SocketAddr::new(*remote_ip, remote_host.port());

                        // Connect.
                        let client = if let Some(source_ip) = resolved.source_ip {
                            SmtpClient::connect_using(
                                source_ip,
                                remote_addr,
                                queue_config.timeouts.connect,
                            )
                            .await
                        } else {
                            SmtpClient::connect(remote_addr, queue_config.timeouts.connect).await
                        };
                        let mut client = match client {
                            Ok(client) => client,
                            Err(err) => {
                                tracing::info!(parent: &span,
                                    context = "connect",
                                    event = "failed",
                                    mx = mx_hostname.as_str(),
                                    remote_ip = %remote_ip,
                                    reason = %err);
                                last_status =
                                    Status::from_client_error(&mx_hostname, "", err);
                                continue 'next_ip;
                            }
                        };

                        let params = DeliveryParams {
                            hostname: &mx_hostname,
                            credentials: remote_host.credentials(),
                            timeout_mail: queue_config.timeouts.mail,
                            timeout_rcpt: queue_config.timeouts.rcpt,
                            timeout_data: queue_config.timeouts.data,
                        };
                        // DANE replaces PKIX (identity is pinned by TLSA),
                        // and opportunistic TLS never fails on certificates.
                        let tls_connector = if dane_policy.is_some()
                            || remote_host.allow_invalid_certs()
                            || (is_direct && !tls_required)
                        {
                            &core.connectors.dummy_verify
                        } else {
                            &core.connectors.pki_verify
                        };

                        let delivery_result = if !remote_host.implicit_tls() {
                            // Greeting and capabilities.
                            client.timeout = queue_config.timeouts.greeting;
                            if let Err(err) = client.read_greeting(&mx_hostname).await {
                                last_status = Status::from_client_error(&mx_hostname, "", err);
                                continue 'next_host;
                            }
                            client.timeout = queue_config.timeouts.ehlo;
                            let capabilities = match client.ehlo(&core.core.hostname).await
                            {
                                Ok(capabilities) => capabilities,
                                Err(err) => {
                                    tracing::info!(parent: &span,
                                        context = "ehlo",
                                        event = "rejected",
                                        mx = mx_hostname.as_str(),
                                        reason = %err);
                                    last_status =
                                        Status::from_client_error(&mx_hostname, "EHLO", err);
                                    continue 'next_host;
                                }
                            };

                            // STARTTLS per the most restrictive policy.
                            client.timeout = queue_config.timeouts.tls;
                            match client
                                .start_tls(tls_connector, &mx_hostname, &capabilities)
                                .await
                            {
                                Ok(mut tls_client) => {
                                    // DANE verification of the presented chain.
                                    if let Some(dane_policy) = &dane_policy {
                                        if let Err(status) = dane_policy.verify(
                                            &span,
                                            &mx_hostname,
                                            tls_client.peer_certificates(),
                                        ) {
                                            if let Some(tls_report) = &tls_report {
                                                schedule_tls_event(
                                                    &core,
                                                    &domain.domain,
                                                    PolicyType::Tlsa(Some(dane_policy.clone())),
                                                    FailureDetails::new(
                                                        ResultType::ValidationFailure,
                                                    )
                                                    .with_receiving_mx_hostname(
                                                        mx_hostname.clone(),
                                                    )
                                                    .with_receiving_ip(*remote_ip)
                                                    .with_failure_reason_code(
                                                        "No matching certificates found.",
                                                    )
                                                    .into(),
                                                    tls_report,
                                                )
                                                .await;
                                            }
                                            tls_client.quit().await;
                                            last_status = status;
                                            continue 'next_host;
                                        }
                                    }

                                    // Success is reported too.
                                    if let Some(tls_report) = &tls_report {
                                        schedule_tls_event(
                                            &core,
                                            &domain.domain,
                                            PolicyType::from((&mta_sts_policy, &dane_policy)),
                                            None,
                                            tls_report,
                                        )
                                        .await;
                                    }

                                    // Re-issue EHLO on the encrypted channel.
                                    tls_client.timeout = queue_config.timeouts.ehlo;
                                    let capabilities =
                                        match tls_client.ehlo(&core.core.hostname).await {
                                            Ok(capabilities) => capabilities,
                                            Err(err) => {
                                                last_status = Status::from_client_error(
                                                    &mx_hostname,
                                                    "EHLO",
                                                    err,
                                                );
                                                continue 'next_host;
                                            }
                                        };
                                    self.message
                                        .deliver(
                                            tls_client,
                                            &capabilities,
                                            recipients
                                                .iter_mut()
                                                .filter(|r| r.domain_idx == domain_idx),
                                            params,
                                        )
                                        .await
                                }
                                Err((err, plain_client)) => {
                                    let reason = err.to_string();
                                    tracing::info!(parent: &span,
                                        context = "tls",
                                        event = "unavailable",
                                        mx = mx_hostname.as_str(),
                                        reason = reason.as_str());

                                    if let Some(tls_report) = &tls_report {
                                        schedule_tls_event(
                                            &core,
                                            &domain.domain,
                                            PolicyType::from((&mta_sts_policy, &dane_policy)),
                                            FailureDetails::new(match &err {
                                                super::client::ClientError::MissingStartTls
                                                | super::client::ClientError::UnexpectedReply(
                                                    _,
                                                ) => ResultType::StartTlsNotSupported,
                                                _ => ResultType::CertificateNotTrusted,
                                            })
                                            .with_receiving_mx_hostname(mx_hostname.clone())
                                            .with_receiving_ip(*remote_ip)
                                            .with_failure_reason_code(reason)
                                            .into(),
                                            tls_report,
                                        )
                                        .await;
                                    }

                                    match plain_client {
                                        Some(client) if !tls_required => {
                                            // Opportunistic: proceed in clear.
                                            self.message
                                                .deliver(
                                                    client,
                                                    &capabilities,
                                                    recipients
                                                        .iter_mut()
                                                        .filter(|r| r.domain_idx == domain_idx),
                                                    params,
                                                )
                                                .await
                                        }
                                        Some(client) => {
                                            client.quit().await;
                                            last_status =
                                                Status::from_starttls_error(&mx_hostname, err);
                                            continue 'next_host;
                                        }
                                        None => {
                                            last_status =
                                                Status::from_tls_error(&mx_hostname, err);
                                            continue 'next_host;
                                        }
                                    }
                                }
                            }
                        } else {
                            // Relay with implicit TLS.
                            client.timeout = queue_config.timeouts.tls;
                            let mut tls_client =
                                match client.into_tls(tls_connector, &mx_hostname).await {
                                    Ok(tls_client) => tls_client,
                                    Err((err, _)) => {
                                        tracing::info!(parent: &span,
                                            context = "tls",
                                            event = "failed",
                                            mx = mx_hostname.as_str(),
                                            reason = %err);
                                        last_status = Status::from_tls_error(&mx_hostname, err);
                                        continue 'next_host;
                                    }
                                };
                            tls_client.timeout = queue_config.timeouts.greeting;
                            if let Err(err) = tls_client.read_greeting(&mx_hostname).await {
                                last_status = Status::from_client_error(&mx_hostname, "", err);
                                continue 'next_host;
                            }
                            tls_client.timeout = queue_config.timeouts.ehlo;
                            let capabilities =
                                match tls_client.ehlo(&core.core.hostname).await {
                                    Ok(capabilities) => capabilities,
                                    Err(err) => {
                                        last_status =
                                            Status::from_client_error(&mx_hostname, "EHLO", err);
                                        continue 'next_host;
                                    }
                                };
                            self.message
                                .deliver(
                                    tls_client,
                                    &capabilities,
                                    recipients
                                        .iter_mut()
                                        .filter(|r| r.domain_idx == domain_idx),
                                    params,
                                )
                                .await
                        };

                        // One connection attempt per domain pass.
                        domain.set_status(delivery_result, queue_config);
                        continue 'next_domain;
                    }
                }

                domain.set_status(last_status, queue_config);
            }
            self.message.domains = domains;
            self.message.recipients = recipients;

            // Notifications that became due during this pass.
            core.send_dsn(&mut self.message, &self.span).await;

            let result = if !on_hold_limiters.is_empty() {
                self.message.save_changes().await;
                tracing::info!(parent: &self.span,
                    context = "queue",
                    event = "requeue",
                    reason = "concurrency-limited",
                    "Too many outbound connections, message moved to the on-hold queue.");
                WorkerResult::OnHold(OnHold {
                    next_due: self.message.next_event(),
                    limiters: on_hold_limiters,
                    message: self.message,
                })
            } else if let Some(due) = self.message.next_event() {
                self.message.save_changes().await;
                tracing::info!(parent: &self.span,
                    context = "queue",
                    event = "requeue",
                    reason = "delivery-incomplete",
                    "Delivery was not possible, message re-queued for delivery.");
                WorkerResult::Retry(Schedule {
                    due,
                    inner: self.message,
                })
            } else {
                self.message.remove().await;
                tracing::info!(parent: &self.span,
                    context = "queue",
                    event = "completed",
                    "Delivery completed.");
                WorkerResult::Done
            };
            notify_manager(&core, result).await;
        });
    }

    /// Marks every domain past its expiration as permanently failed.
    fn handle_expired(&mut self) -> bool {
        let now_ts = now();
        let mut has_pending = false;
        for (idx, domain) in self.message.domains.iter_mut().enumerate() {
            match &domain.status {
                Status::TemporaryFailure(err) if domain.expires <= now_ts => {
                    tracing::info!(parent: &self.span,
                        event = "delivery-expired",
                        domain = domain.domain.as_str(),
                        reason = %err);
                    for rcpt in &mut self.message.recipients {
                        if rcpt.domain_idx == idx {
                            rcpt.status = std::mem::replace(&mut rcpt.status, Status::Scheduled)
                                .into_permanent();
                        }
                    }
                    domain.status =
                        std::mem::replace(&mut domain.status, Status::Scheduled).into_permanent();
                    domain.changed = true;
                }
                Status::Scheduled if domain.expires <= now_ts => {
                    tracing::info!(parent: &self.span,
                        event = "delivery-expired",
                        domain = domain.domain.as_str(),
                        reason = "Message expired without a delivery attempt.");
                    for rcpt in &mut self.message.recipients {
                        if rcpt.domain_idx == idx {
                            rcpt.status = std::mem::replace(&mut rcpt.status, Status::Scheduled)
                                .into_permanent();
                        }
                    }
                    domain.status = Status::PermanentFailure(Error::Io(
                        "Message expired without a delivery attempt.".to_string(),
                    ));
                    domain.changed = true;
                }
                Status::Completed(_) | Status::PermanentFailure(_) => (),
                _ => {
                    has_pending = true;
                }
            }
        }
        has_pending
    }
}

async fn notify_manager(core: &Arc<SMTP>, result: WorkerResult) {
    if core.queue.tx.send(Event::Done(result)).await.is_err() {
        tracing::warn!("Channel closed while trying to notify the queue manager.");
    }
}

async fn schedule_tls_event(
    core: &Arc<SMTP>,
    domain: &str,
    policy: PolicyType,
    failure: Option<FailureDetails>,
    tls_report: &TlsRptRecord,
) {
    core.schedule_report(TlsEvent {
        domain: domain.to_string(),
        policy,
        failure,
        rua: tls_report.rua.clone(),
    })
    .await;
}
