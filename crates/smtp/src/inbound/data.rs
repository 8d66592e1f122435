/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

use auth::{
    dkim::DkimResult,
    dmarc::{self, DmarcResult},
    message::ParsedMessage,
    report::{AuthenticationResults, ReceivedSpf},
};
use common::{listener::SessionStream, store::DeliverEnvelope};
use mail_builder::headers::{date::Date, message_id::generate_message_id_header};
use mail_parser::MessageParser;

use crate::{
    core::{Session, State},
    queue::{now, DomainPart},
};

impl<T: SessionStream> Session<T> {
    /// The post-DATA pipeline: authenticate, annotate, sign, then commit the
    /// message to the store or the queue before replying 250. An empty
    /// return value requests disconnection.
    pub async fn queue_message(&mut self) -> Cow<'static, [u8]> {
        let raw_message = std::mem::take(&mut self.data.message);

        // The declared SIZE is binding.
        if self.data.declared_size > 0 && raw_message.len() > self.data.declared_size {
            tracing::info!(parent: &self.span,
                context = "data",
                event = "size-exceeded",
                declared = self.data.declared_size,
                size = raw_message.len());
            return (&b"552 5.3.4 Message exceeds declared size.\r\n"[..]).into();
        }

        let Some(parsed) = ParsedMessage::parse(&raw_message) else {
            tracing::info!(parent: &self.span,
                context = "data",
                event = "parse-failed",
                size = raw_message.len());
            return (&b"550 5.7.7 Failed to parse message.\r\n"[..]).into();
        };
        let headers_message = MessageParser::default().parse(&raw_message);
        let msg_from_domain = headers_message
            .as_ref()
            .and_then(|message| message.from())
            .and_then(|from| from.first())
            .and_then(|addr| addr.address())
            .map(|address| address.domain_part().to_lowercase())
            .unwrap_or_default();
        if msg_from_domain.is_empty() && self.params.dmarc.verify() {
            return (&b"550 5.7.7 Message lacks a valid From header.\r\n"[..]).into();
        }

        // Loop detection.
        if parsed.received_count() > self.params.max_received_headers {
            tracing::info!(parent: &self.span,
                context = "data",
                event = "loop-detected",
                received_headers = parsed.received_count());
            return (&b"450 4.4.6 Too many Received headers. Possible loop detected.\r\n"[..])
                .into();
        }

        // DKIM.
        let resolver = &self.core.core.resolver;
        let dkim_output = if self.params.dkim.verify() || self.params.dmarc.verify() {
            let dkim_output = auth::dkim::verify::verify_dkim(resolver, &parsed, now()).await;
            let rejected = self.params.dkim.is_strict()
                && !dkim_output.is_empty()
                && !dkim_output.iter().any(|output| output.is_pass());

            if rejected {
                tracing::info!(parent: &self.span,
                    context = "dkim",
                    event = "failed",
                    from = msg_from_domain,
                    result = ?dkim_output.iter().map(|d| d.result().to_string()).collect::<Vec<_>>(),
                    "No passing DKIM signatures found.");

                return if dkim_output
                    .iter()
                    .any(|d| matches!(d.result(), DkimResult::TempError(_)))
                {
                    (&b"451 4.7.20 No passing DKIM signatures found.\r\n"[..]).into()
                } else {
                    (&b"550 5.7.20 No passing DKIM signatures found.\r\n"[..]).into()
                };
            } else {
                tracing::debug!(parent: &self.span,
                    context = "dkim",
                    event = "verify",
                    from = msg_from_domain,
                    result = ?dkim_output.iter().map(|d| d.result().to_string()).collect::<Vec<_>>());
            }
            dkim_output
        } else {
            Vec::new()
        };

        // Authentication results so far.
        let mail_from = self.data.mail_from.clone().unwrap();
        let mut auth_results = AuthenticationResults::new(&self.instance.hostname);
        if !dkim_output.is_empty() {
            auth_results = auth_results.with_dkim_results(&dkim_output);
        }
        if let Some(spf_ehlo) = &self.data.spf_ehlo {
            auth_results = auth_results.with_spf_result(spf_ehlo, self.data.remote_ip, "");
        }
        if let Some(spf_mail_from) = &self.data.spf_mail_from {
            auth_results = auth_results.with_spf_result(
                spf_mail_from,
                self.data.remote_ip,
                &mail_from.address_lcase,
            );
        }
        if let Some(iprev) = &self.data.iprev {
            auth_results = auth_results.with_iprev_result(iprev, self.data.remote_ip);
        }

        // DMARC: a null reverse path is evaluated against the HELO identity.
        if self.params.dmarc.verify() && !msg_from_domain.is_empty() {
            let spf_output = self
                .data
                .spf_mail_from
                .as_ref()
                .or(self.data.spf_ehlo.as_ref());
            let dmarc_output = dmarc::verify::verify_dmarc(
                resolver,
                &self.core.core.psl,
                &msg_from_domain,
                &dkim_output,
                spf_output,
                self.data.session_id,
            )
            .await;

            auth_results = auth_results.with_dmarc_result(&dmarc_output);
            let rejected = self.params.dmarc.is_strict()
                && dmarc_output.policy() == dmarc::Policy::Reject
                && dmarc_output.result() == &DmarcResult::Fail;
            let is_temp_fail = matches!(dmarc_output.result(), DmarcResult::TempError(_));

            if rejected || (self.params.dmarc.is_strict() && is_temp_fail) {
                tracing::info!(parent: &self.span,
                    context = "dmarc",
                    event = "auth-failed",
                    from = msg_from_domain,
                    result = %dmarc_output.result(),
                    policy = %dmarc_output.policy());

                return if is_temp_fail {
                    (&b"451 4.7.1 Email temporarily rejected per DMARC policy.\r\n"[..]).into()
                } else {
                    (&b"550 5.7.1 Email rejected per DMARC policy.\r\n"[..]).into()
                };
            }
            tracing::debug!(parent: &self.span,
                context = "dmarc",
                event = "verify",
                from = msg_from_domain,
                result = %dmarc_output.result(),
                alignment = ?dmarc_output.alignment);
        }

        // Push back on senders this instance has never written to.
        if let Some(delay) = self.params.first_time_sender_delay {
            if self.data.authenticated_as.is_empty()
                && !mail_from.address_lcase.is_empty()
                && !self
                    .core
                    .known_senders
                    .contains("", &mail_from.address_lcase)
            {
                tracing::debug!(parent: &self.span,
                    context = "data",
                    event = "first-time-sender",
                    sender = mail_from.address_lcase.as_str(),
                    delay = delay.as_secs());
                common::sleep::sleep(&self.instance.shutdown, delay).await;
            }
        }

        // Assemble the locally added headers.
        let mut headers = Vec::with_capacity(256);
        self.write_received(&mut headers);
        auth_results.write_header(&mut headers);
        if let Some(spf_output) = &self.data.spf_mail_from {
            ReceivedSpf::new(
                spf_output,
                self.data.remote_ip,
                &self.data.helo_domain,
                &mail_from.address_lcase,
                &self.instance.hostname,
            )
            .write_header(&mut headers);
        }

        let is_submission = !self.data.authenticated_as.is_empty();
        if is_submission {
            if headers_message
                .as_ref()
                .map_or(true, |message| message.date().is_none())
            {
                headers.extend_from_slice(b"Date: ");
                headers.extend_from_slice(Date::now().to_rfc822().as_bytes());
                headers.extend_from_slice(b"\r\n");
            }
            if headers_message
                .as_ref()
                .map_or(true, |message| message.message_id().is_none())
            {
                headers.extend_from_slice(b"Message-ID: ");
                let _ = generate_message_id_header(&mut headers, &self.instance.hostname);
                headers.extend_from_slice(b"\r\n");
            }

            // DKIM-sign submissions for the From domain.
            for signer in self.core.core.mail_auth.signers_for(&msg_from_domain) {
                match signer.sign_chained(&[headers.as_slice(), raw_message.as_slice()], now()) {
                    Ok(signature) => {
                        headers.extend_from_slice(signature.as_bytes());
                    }
                    Err(err) => {
                        tracing::info!(parent: &self.span,
                            context = "dkim",
                            event = "sign-failed",
                            domain = msg_from_domain,
                            "Failed to sign message: {err}");
                    }
                }
            }

            self.queue_for_delivery(mail_from, headers, raw_message).await
        } else {
            self.deliver_local(mail_from, headers, raw_message).await
        }
    }

    /// Authenticated submission: spool for outbound delivery.
    async fn queue_for_delivery(
        &mut self,
        mail_from: crate::core::SessionAddress,
        headers: Vec<u8>,
        raw_message: Vec<u8>,
    ) -> Cow<'static, [u8]> {
        let mut message = self.core.new_message(mail_from.address.clone(), None);
        message.flags = mail_from.flags;
        message.env_id = mail_from.dsn_info.clone();
        let rcpt_to = std::mem::take(&mut self.data.rcpt_to);
        for rcpt in &rcpt_to {
            // Remember the correspondent for the first-time-sender check.
            self.core
                .known_senders
                .record("", &rcpt.address_lcase);
            message.add_recipient_parts(
                rcpt.address.clone(),
                rcpt.address_lcase.clone(),
                rcpt.domain.clone(),
                rcpt.flags,
                rcpt.dsn_info.clone(),
                &self.core.core.queue,
            );
        }

        let size = headers.len() + raw_message.len();
        let Some(quota_ref) = self.core.queue.quota.is_allowed(size) else {
            tracing::warn!(parent: &self.span,
                context = "queue",
                event = "quota-exceeded",
                from = message.return_path,
                "Queue quota exceeded, rejecting message.");
            return (&b"452 4.3.1 Mail system full, try again later.\r\n"[..]).into();
        };
        message.quota_refs.push(quota_ref);

        let queue_id = {
            let id = self.core.queue_id();
            message.id = id;
            id
        };
        if self
            .core
            .queue_message(message, Some(&headers), &raw_message, &self.span)
            .await
        {
            self.state = State::Accepted(queue_id);
            self.data.messages_sent += 1;
            (&b"250 2.0.0 Message queued for delivery.\r\n"[..]).into()
        } else {
            (&b"451 4.3.5 Unable to accept message at this time.\r\n"[..]).into()
        }
    }

    /// Inbound mail: deliver into the store, one recipient at a time. A
    /// partial failure after the first successful delivery is reported as
    /// accepted and bounced per-recipient, never re-queued whole.
    async fn deliver_local(
        &mut self,
        mail_from: crate::core::SessionAddress,
        headers: Vec<u8>,
        raw_message: Vec<u8>,
    ) -> Cow<'static, [u8]> {
        let mut message = Vec::with_capacity(headers.len() + raw_message.len());
        message.extend_from_slice(&headers);
        message.extend_from_slice(&raw_message);

        let rcpt_to = std::mem::take(&mut self.data.rcpt_to);
        let mut delivered = 0;
        let mut failures: Vec<(crate::core::SessionAddress, common::store::StoreError)> =
            Vec::new();
        for rcpt in rcpt_to {
            let store = &self.core.core.store;
            let account = match store.open_account(&rcpt.address_lcase).await {
                Some(account) => account,
                None => {
                    failures.push((
                        rcpt,
                        common::store::StoreError::Permanent("no such user".to_string()),
                    ));
                    continue;
                }
            };
            let envelope = DeliverEnvelope {
                return_path: mail_from.address_lcase.clone(),
                recipient: rcpt.address_lcase.clone(),
                remote_ip: self.data.remote_ip.to_string(),
                flags: mail_from.flags,
            };
            match store.deliver(&account, "INBOX", &envelope, &message).await {
                Ok(id) => {
                    tracing::info!(parent: &self.span,
                        context = "data",
                        event = "delivered",
                        account = account.as_str(),
                        id = id);
                    store.notify(&account);
                    delivered += 1;
                }
                Err(err) => {
                    tracing::warn!(parent: &self.span,
                        context = "data",
                        event = "delivery-failed",
                        account = account.as_str(),
                        reason = %err);
                    failures.push((rcpt, err));
                }
            }
        }

        self.data.messages_sent += 1;
        if failures.is_empty() {
            (&b"250 2.0.0 Message delivered.\r\n"[..]).into()
        } else if delivered == 0 {
            // Nothing was committed, let the peer handle it.
            if failures
                .iter()
                .all(|(_, err)| matches!(err, common::store::StoreError::Permanent(_)))
            {
                (&b"550 5.5.0 Message delivery failed.\r\n"[..]).into()
            } else {
                (&b"451 4.3.5 Unable to accept message at this time.\r\n"[..]).into()
            }
        } else {
            // Partially committed: accept and bounce the failures ourselves.
            if !mail_from.address_lcase.is_empty() {
                self.core
                    .send_local_failure_dsn(&mail_from.address, failures, &message, &self.span)
                    .await;
            }
            (&b"250 2.0.0 Message delivered.\r\n"[..]).into()
        }
    }

    fn write_received(&self, headers: &mut Vec<u8>) {
        headers.extend_from_slice(b"Received: from ");
        headers.extend_from_slice(self.data.helo_domain.as_bytes());
        headers.extend_from_slice(b" (");
        headers.extend_from_slice(
            self.data
                .iprev
                .as_ref()
                .and_then(|iprev| iprev.ptr.first())
                .map(|ptr| ptr.as_str())
                .unwrap_or("unknown")
                .as_bytes(),
        );
        headers.extend_from_slice(b" [");
        headers.extend_from_slice(self.data.remote_ip.to_string().as_bytes());
        headers.extend_from_slice(b"])\r\n\t");
        if self.stream.is_tls() {
            let (version, cipher) = self.stream.tls_version_and_cipher();
            headers.extend_from_slice(b"(using ");
            headers.extend_from_slice(version.as_bytes());
            headers.extend_from_slice(b" with cipher ");
            headers.extend_from_slice(cipher.as_bytes());
            headers.extend_from_slice(b")\r\n\t");
        }
        headers.extend_from_slice(b"by ");
        headers.extend_from_slice(self.instance.hostname.as_bytes());
        headers.extend_from_slice(b" (maild) with ");
        headers.extend_from_slice(
            match (self.stream.is_tls(), self.data.authenticated_as.is_empty()) {
                (true, true) => b"ESMTPS".as_slice(),
                (true, false) => b"ESMTPSA".as_slice(),
                (false, true) => b"ESMTP".as_slice(),
                (false, false) => b"ESMTPA".as_slice(),
            },
        );
        // The id token is sealed with the instance key; only the operator
        // can map it back to a connection.
        headers.extend_from_slice(b" id ");
        headers.extend_from_slice(
            self.core
                .inner
                .received_token
                .encode(self.data.session_id)
                .as_bytes(),
        );
        headers.extend_from_slice(b";\r\n\t");
        headers.extend_from_slice(Date::now().to_rfc822().as_bytes());
        headers.extend_from_slice(b"\r\n");
    }
}
