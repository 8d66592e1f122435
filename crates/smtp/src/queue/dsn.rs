/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::Write;

use common::store::StoreError;
use mail_builder::{
    headers::{content_type::ContentType, HeaderType},
    mime::{BodyPart, MimePart},
    MessageBuilder,
};
use mail_parser::DateTime;
use smtp_proto::{
    Response, RCPT_NOTIFY_DELAY, RCPT_NOTIFY_FAILURE, RCPT_NOTIFY_NEVER, RCPT_NOTIFY_SUCCESS,
};

use crate::core::{SessionAddress, SMTP};

use super::{
    now, Domain, Error, ErrorDetails, HostResponse, Message, Recipient, Status, RCPT_DSN_SENT,
    RCPT_STATUS_CHANGED,
};

impl SMTP {
    /// Sends delivery status notifications due for `message`: failures,
    /// delays and requested success notifications. A null reverse path is
    /// never bounced.
    pub async fn send_dsn(&self, message: &mut Message, span: &tracing::Span) {
        if !message.return_path.is_empty() {
            let headers = message.read_message_headers(1024).await;
            if let Some(dsn) = message.build_dsn(self, &headers).await {
                let mut dsn_message = self.new_message("", None);
                dsn_message.add_recipient_parts(
                    message.return_path.clone(),
                    message.return_path_lcase.clone(),
                    message.return_path_domain.clone(),
                    RCPT_NOTIFY_NEVER,
                    None,
                    &self.core.queue,
                );

                // DSNs are signed with the local postmaster-domain keys.
                let signature = self.sign_report(&dsn);
                self.queue_message(dsn_message, signature.as_deref(), &dsn, span)
                    .await;
            }
        } else {
            message.handle_double_bounce(span);
        }
    }

    /// Bounces recipients whose local delivery failed after the message had
    /// already been accepted for others.
    pub async fn send_local_failure_dsn(
        &self,
        return_path: &str,
        failures: Vec<(SessionAddress, StoreError)>,
        original_message: &[u8],
        span: &tracing::Span,
    ) {
        let mut message = self.new_message(return_path, None);
        for (rcpt, err) in failures {
            message.add_recipient_parts(
                rcpt.address,
                rcpt.address_lcase,
                rcpt.domain,
                RCPT_NOTIFY_FAILURE,
                None,
                &self.core.queue,
            );
            let error = match err {
                StoreError::Permanent(err) => Status::PermanentFailure(Error::Io(err)),
                StoreError::Temporary(err) => Status::PermanentFailure(Error::Io(err)),
            };
            if let Some(domain) = message.domains.last_mut() {
                domain.status = error;
            }
        }

        let headers_len = original_message
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|pos| pos + 2)
            .unwrap_or(original_message.len().min(1024));
        let headers = &original_message[..headers_len];
        if let Some(dsn) = message.build_dsn(self, headers).await {
            let mut dsn_message = self.new_message("", None);
            dsn_message.add_recipient(return_path, &self.core.queue);
            let signature = self.sign_report(&dsn);
            self.queue_message(dsn_message, signature.as_deref(), &dsn, span)
                .await;
        }
    }

    pub fn sign_report(&self, report: &[u8]) -> Option<Vec<u8>> {
        let mut headers = Vec::new();
        for signer in &self.core.mail_auth.sign_local {
            match signer.sign(report) {
                Ok(signature) => headers.extend_from_slice(signature.as_bytes()),
                Err(err) => {
                    tracing::warn!(
                        context = "dkim",
                        event = "sign-failed",
                        reason = %err);
                }
            }
        }
        (!headers.is_empty()).then_some(headers)
    }
}

impl Message {
    pub async fn build_dsn(&mut self, core: &SMTP, original_headers: &[u8]) -> Option<Vec<u8>> {
        let config = &core.core.queue;
        let now_ts = now();

        let mut txt_success = String::new();
        let mut txt_delay = String::new();
        let mut txt_failed = String::new();
        let mut dsn = String::new();

        for rcpt in &mut self.recipients {
            if rcpt.has_flag(RCPT_DSN_SENT | RCPT_NOTIFY_NEVER) {
                continue;
            }
            let domain = &self.domains[rcpt.domain_idx];
            match &rcpt.status {
                Status::Completed(response) => {
                    rcpt.flags |= RCPT_DSN_SENT | RCPT_STATUS_CHANGED;
                    if !rcpt.has_flag(RCPT_NOTIFY_SUCCESS) {
                        continue;
                    }
                    rcpt.write_dsn(&mut dsn);
                    rcpt.status.write_dsn(&mut dsn);
                    response.write_dsn_text(&rcpt.address, &mut txt_success);
                }
                Status::TemporaryFailure(response)
                    if domain.notify.due <= now_ts && rcpt.has_flag(RCPT_NOTIFY_DELAY) =>
                {
                    rcpt.write_dsn(&mut dsn);
                    rcpt.status.write_dsn(&mut dsn);
                    domain.write_dsn_will_retry_until(&mut dsn);
                    response.write_dsn_text(&rcpt.address, &mut txt_delay);
                }
                Status::PermanentFailure(response) => {
                    rcpt.flags |= RCPT_DSN_SENT | RCPT_STATUS_CHANGED;
                    if !rcpt.has_flag(RCPT_NOTIFY_FAILURE) {
                        continue;
                    }
                    rcpt.write_dsn(&mut dsn);
                    rcpt.status.write_dsn(&mut dsn);
                    response.write_dsn_text(&rcpt.address, &mut txt_failed);
                }
                Status::Scheduled => {
                    // No per-recipient status yet, report the domain status.
                    match &domain.status {
                        Status::PermanentFailure(err) => {
                            rcpt.flags |= RCPT_DSN_SENT | RCPT_STATUS_CHANGED;
                            if !rcpt.has_flag(RCPT_NOTIFY_FAILURE) {
                                continue;
                            }
                            rcpt.write_dsn(&mut dsn);
                            domain.status.write_dsn(&mut dsn);
                            err.write_dsn_text(&rcpt.address, &domain.domain, &mut txt_failed);
                        }
                        Status::TemporaryFailure(err)
                            if domain.notify.due <= now_ts
                                && rcpt.has_flag(RCPT_NOTIFY_DELAY) =>
                        {
                            rcpt.write_dsn(&mut dsn);
                            domain.status.write_dsn(&mut dsn);
                            domain.write_dsn_will_retry_until(&mut dsn);
                            err.write_dsn_text(&rcpt.address, &domain.domain, &mut txt_delay);
                        }
                        _ => continue,
                    }
                }
                _ => continue,
            }

            dsn.push_str("\r\n");
        }

        let txt_len = txt_success.len() + txt_delay.len() + txt_failed.len();
        if txt_len == 0 {
            return None;
        }

        let has_success = !txt_success.is_empty();
        let has_delay = !txt_delay.is_empty();
        let has_failure = !txt_failed.is_empty();

        let mut txt = String::with_capacity(txt_len + 128);
        let (subject, is_mixed) = if has_success && !has_delay && !has_failure {
            txt.push_str(
                "Your message has been successfully delivered to the following recipients:\r\n\r\n",
            );
            ("Successfully delivered message", false)
        } else if has_delay && !has_success && !has_failure {
            txt.push_str(
                "There was a temporary problem delivering your message to the following recipients:\r\n\r\n",
            );
            ("Warning: Delay in message delivery", false)
        } else if has_failure && !has_success && !has_delay {
            txt.push_str("Your message could not be delivered to the following recipients:\r\n\r\n");
            ("Failed to deliver message", false)
        } else if has_success {
            txt.push_str("Your message has been partially delivered:\r\n\r\n");
            ("Partially delivered message", true)
        } else {
            txt.push_str("Your message could not be delivered to some recipients:\r\n\r\n");
            (
                "Warning: Temporary and permanent failures during message delivery",
                true,
            )
        };

        if has_success {
            if is_mixed {
                txt.push_str("    ----- Delivery to the following addresses was successful -----\r\n");
            }
            txt.push_str(&txt_success);
            txt.push_str("\r\n");
        }
        if has_delay {
            if is_mixed {
                txt.push_str(
                    "    ----- There was a temporary problem delivering to these addresses -----\r\n",
                );
            }
            txt.push_str(&txt_delay);
            txt.push_str("\r\n");
        }
        if has_failure {
            if is_mixed {
                txt.push_str("    ----- Delivery to the following addresses failed -----\r\n");
            }
            txt.push_str(&txt_failed);
            txt.push_str("\r\n");
        }

        // Advance the delay-notification schedule.
        if has_delay {
            for domain in &mut self.domains {
                if matches!(
                    &domain.status,
                    Status::TemporaryFailure(_) | Status::Scheduled
                ) && domain.notify.due <= now_ts
                {
                    if let Some(next_notify) = config
                        .notify
                        .get((domain.notify.inner + 1) as usize)
                    {
                        domain.notify.inner += 1;
                        domain.notify.due = now_ts + next_notify.as_secs();
                    } else {
                        domain.notify.due = domain.expires + 10;
                    }
                    domain.changed = true;
                }
            }
        }

        let reporting_mta = core.core.report.submitter.as_str();
        let mut dsn_header = String::with_capacity(dsn.len() + 128);
        self.write_dsn_headers(&mut dsn_header, reporting_mta);
        let dsn = dsn_header + dsn.as_str();

        let headers_text = String::from_utf8_lossy(original_headers).into_owned();
        MessageBuilder::new()
            .from((config.dsn_name.as_str(), config.dsn_address.as_str()))
            .header("To", HeaderType::Text(self.return_path.as_str().into()))
            .header("Auto-Submitted", HeaderType::Text("auto-generated".into()))
            .message_id(format!("{}.{}@{}", self.id, self.created, reporting_mta))
            .subject(subject)
            .body(MimePart::new(
                ContentType::new("multipart/report").attribute("report-type", "delivery-status"),
                BodyPart::Multipart(vec![
                    MimePart::new(ContentType::new("text/plain"), BodyPart::Text(txt.into())),
                    MimePart::new(
                        ContentType::new("message/delivery-status"),
                        BodyPart::Text(dsn.into()),
                    ),
                    MimePart::new(
                        ContentType::new("message/rfc822"),
                        BodyPart::Text(headers_text.into()),
                    ),
                ]),
            ))
            .write_to_vec()
            .unwrap_or_default()
            .into()
    }

    /// A failed message with a null reverse path is dropped, not bounced.
    fn handle_double_bounce(&mut self, span: &tracing::Span) {
        let mut failures = Vec::new();
        for rcpt in &mut self.recipients {
            if !rcpt.has_flag(RCPT_DSN_SENT) {
                match &rcpt.status {
                    Status::PermanentFailure(err) => {
                        rcpt.flags |= RCPT_DSN_SENT;
                        failures.push(err.to_string());
                    }
                    Status::Scheduled => {
                        let domain = &self.domains[rcpt.domain_idx];
                        if let Status::PermanentFailure(err) = &domain.status {
                            rcpt.flags |= RCPT_DSN_SENT;
                            failures.push(err.to_string());
                        }
                    }
                    _ => (),
                }
            }
        }

        let now_ts = now();
        for domain in &mut self.domains {
            if domain.notify.due <= now_ts {
                domain.notify.due = domain.expires + 10;
            }
        }

        if !failures.is_empty() {
            tracing::info!(parent: span,
                context = "queue",
                event = "double-bounce",
                id = self.id,
                failures = ?failures,
                "Failed delivery of message with null return path.");
        }
    }

    fn write_dsn_headers(&self, dsn: &mut String, reporting_mta: &str) {
        let _ = write!(dsn, "Reporting-MTA: dns;{reporting_mta}\r\n");
        dsn.push_str("Arrival-Date: ");
        dsn.push_str(&DateTime::from_timestamp(self.created as i64).to_rfc822());
        dsn.push_str("\r\n");
        if let Some(env_id) = &self.env_id {
            let _ = write!(dsn, "Original-Envelope-Id: {env_id}\r\n");
        }
        dsn.push_str("\r\n");
    }
}

impl HostResponse<String> {
    fn write_dsn_text(&self, addr: &str, dsn: &mut String) {
        let _ = write!(
            dsn,
            "<{}> (delivered to '{}' with code {} ({}.{}.{}) '",
            addr,
            self.hostname,
            self.response.code,
            self.response.esc[0],
            self.response.esc[1],
            self.response.esc[2]
        );
        self.response.write_response(dsn);
        dsn.push_str("')\r\n");
    }
}

impl HostResponse<ErrorDetails> {
    fn write_dsn_text(&self, addr: &str, dsn: &mut String) {
        let _ = write!(dsn, "<{}> (host '{}' rejected ", addr, self.hostname.entity);
        if !self.hostname.details.is_empty() {
            let _ = write!(dsn, "command '{}'", self.hostname.details);
        } else {
            dsn.push_str("transaction");
        }
        let _ = write!(
            dsn,
            " with code {} ({}.{}.{}) '",
            self.response.code, self.response.esc[0], self.response.esc[1], self.response.esc[2]
        );
        self.response.write_response(dsn);
        dsn.push_str("')\r\n");
    }
}

impl Error {
    fn write_dsn_text(&self, addr: &str, domain: &str, dsn: &mut String) {
        match self {
            Error::UnexpectedResponse(response) => {
                response.write_dsn_text(addr, dsn);
            }
            Error::DnsError(err) => {
                let _ = write!(dsn, "<{addr}> (failed to lookup '{domain}': {err})\r\n");
            }
            Error::NullMx => {
                let _ = write!(
                    dsn,
                    "<{addr}> ('{domain}' does not accept messages (null MX))\r\n",
                );
            }
            Error::ConnectionError(details) => {
                let _ = write!(
                    dsn,
                    "<{}> (connection to '{}' failed: {})\r\n",
                    addr, details.entity, details.details
                );
            }
            Error::TlsError(details) => {
                let _ = write!(
                    dsn,
                    "<{}> (TLS error from '{}': {})\r\n",
                    addr, details.entity, details.details
                );
            }
            Error::DaneError(details) => {
                let _ = write!(
                    dsn,
                    "<{}> (DANE failed to authenticate '{}': {})\r\n",
                    addr, details.entity, details.details
                );
            }
            Error::MtaStsError(details) => {
                let _ = write!(
                    dsn,
                    "<{addr}> (MTA-STS failed to authenticate '{domain}': {details})\r\n",
                );
            }
            Error::RateLimited => {
                let _ = write!(dsn, "<{addr}> (rate limited)\r\n");
            }
            Error::ConcurrencyLimited => {
                let _ = write!(
                    dsn,
                    "<{addr}> (too many concurrent connections to remote server)\r\n",
                );
            }
            Error::Io(err) => {
                let _ = write!(dsn, "<{addr}> (delivery failed: {err})\r\n");
            }
        }
    }
}

impl Recipient {
    fn write_dsn(&self, dsn: &mut String) {
        if let Some(orcpt) = &self.orcpt {
            let _ = write!(dsn, "Original-Recipient: rfc822;{orcpt}\r\n");
        }
        let _ = write!(dsn, "Final-Recipient: rfc822;{}\r\n", self.address);
    }
}

impl Domain {
    fn write_dsn_will_retry_until(&self, dsn: &mut String) {
        if self.expires > now() {
            dsn.push_str("Will-Retry-Until: ");
            dsn.push_str(&DateTime::from_timestamp(self.expires as i64).to_rfc822());
            dsn.push_str("\r\n");
        }
    }
}

trait WriteDsn {
    fn write_dsn_status(&self, dsn: &mut String);
    fn write_dsn_diagnostic(&self, dsn: &mut String);
    fn write_response(&self, dsn: &mut String);
}

impl WriteDsn for Response<String> {
    fn write_dsn_status(&self, dsn: &mut String) {
        if self.esc[0] > 0 {
            let _ = write!(dsn, "{}.{}.{}", self.esc[0], self.esc[1], self.esc[2]);
        } else {
            let _ = write!(
                dsn,
                "{}.{}.{}",
                self.code / 100,
                (self.code / 10) % 10,
                self.code % 10
            );
        }
    }

    fn write_dsn_diagnostic(&self, dsn: &mut String) {
        let _ = write!(dsn, "Diagnostic-Code: smtp;{} ", self.code);
        self.write_response(dsn);
        dsn.push_str("\r\n");
    }

    fn write_response(&self, dsn: &mut String) {
        for ch in self.message.chars() {
            if ch != '\n' && ch != '\r' {
                dsn.push(ch);
            }
        }
    }
}

impl<T, E> Status<T, E> {
    fn write_dsn_action(&self, dsn: &mut String) {
        dsn.push_str("Action: ");
        dsn.push_str(match self {
            Status::Completed(_) => "delivered",
            Status::PermanentFailure(_) => "failed",
            Status::TemporaryFailure(_) | Status::Scheduled => "delayed",
        });
        dsn.push_str("\r\n");
    }
}

impl Status<HostResponse<String>, HostResponse<ErrorDetails>> {
    fn write_dsn(&self, dsn: &mut String) {
        self.write_dsn_action(dsn);
        self.write_dsn_status(dsn);
        self.write_dsn_diagnostic(dsn);
        self.write_dsn_remote_mta(dsn);
    }

    fn write_dsn_status(&self, dsn: &mut String) {
        dsn.push_str("Status: ");
        if let Status::Completed(HostResponse { response, .. })
        | Status::PermanentFailure(HostResponse { response, .. })
        | Status::TemporaryFailure(HostResponse { response, .. }) = self
        {
            response.write_dsn_status(dsn);
        }
        dsn.push_str("\r\n");
    }

    fn write_dsn_remote_mta(&self, dsn: &mut String) {
        dsn.push_str("Remote-MTA: dns;");
        if let Status::Completed(HostResponse { hostname, .. }) = self {
            dsn.push_str(hostname);
        } else if let Status::PermanentFailure(HostResponse {
            hostname: ErrorDetails { entity, .. },
            ..
        })
        | Status::TemporaryFailure(HostResponse {
            hostname: ErrorDetails { entity, .. },
            ..
        }) = self
        {
            dsn.push_str(entity);
        }
        dsn.push_str("\r\n");
    }

    fn write_dsn_diagnostic(&self, dsn: &mut String) {
        if let Status::PermanentFailure(details) | Status::TemporaryFailure(details) = self {
            details.response.write_dsn_diagnostic(dsn);
        }
    }
}

impl Status<(), Error> {
    fn write_dsn(&self, dsn: &mut String) {
        self.write_dsn_action(dsn);
        self.write_dsn_status(dsn);
        self.write_dsn_diagnostic(dsn);
        self.write_dsn_remote_mta(dsn);
    }

    fn write_dsn_status(&self, dsn: &mut String) {
        if let Status::PermanentFailure(err) | Status::TemporaryFailure(err) = self {
            dsn.push_str("Status: ");
            match err {
                Error::UnexpectedResponse(response) => {
                    response.response.write_dsn_status(dsn);
                }
                // RFC 7505 §3: null MX is a permanent "bad destination
                // system address".
                Error::NullMx => dsn.push_str("5.1.10"),
                _ => {
                    dsn.push_str(if matches!(self, Status::PermanentFailure(_)) {
                        "5.0.0"
                    } else {
                        "4.0.0"
                    });
                }
            }
            dsn.push_str("\r\n");
        }
    }

    fn write_dsn_remote_mta(&self, dsn: &mut String) {
        if let Status::PermanentFailure(err) | Status::TemporaryFailure(err) = self {
            match err {
                Error::UnexpectedResponse(HostResponse {
                    hostname: details, ..
                })
                | Error::ConnectionError(details)
                | Error::TlsError(details)
                | Error::DaneError(details) => {
                    dsn.push_str("Remote-MTA: dns;");
                    dsn.push_str(&details.entity);
                    dsn.push_str("\r\n");
                }
                _ => (),
            }
        }
    }

    fn write_dsn_diagnostic(&self, dsn: &mut String) {
        if let Status::PermanentFailure(Error::UnexpectedResponse(response))
        | Status::TemporaryFailure(Error::UnexpectedResponse(response)) = self
        {
            response.response.write_dsn_diagnostic(dsn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Schedule;

    fn failed_recipient() -> (Vec<Domain>, Vec<Recipient>) {
        (
            vec![Domain {
                domain: "b.example".to_string(),
                retry: Schedule::now(),
                notify: Schedule { due: 0, inner: 0 },
                expires: now() + 86400,
                status: Status::Scheduled,
                changed: false,
            }],
            vec![Recipient {
                domain_idx: 0,
                address: "bob@b.example".to_string(),
                address_lcase: "bob@b.example".to_string(),
                status: Status::PermanentFailure(HostResponse {
                    hostname: ErrorDetails {
                        entity: "mx.b.example".to_string(),
                        details: "RCPT TO:<bob@b.example>".to_string(),
                    },
                    response: Response {
                        code: 550,
                        esc: [5, 1, 1],
                        message: "No such user".to_string(),
                    },
                }),
                flags: RCPT_NOTIFY_FAILURE,
                orcpt: None,
            }],
        )
    }

    #[test]
    fn dsn_fields_for_permanent_failure() {
        let (domains, recipients) = failed_recipient();
        let mut dsn = String::new();
        recipients[0].write_dsn(&mut dsn);
        recipients[0].status.write_dsn(&mut dsn);

        assert!(dsn.contains("Final-Recipient: rfc822;bob@b.example\r\n"), "{dsn}");
        assert!(dsn.contains("Action: failed\r\n"), "{dsn}");
        assert!(dsn.contains("Status: 5.1.1\r\n"), "{dsn}");
        assert!(dsn.contains("Remote-MTA: dns;mx.b.example\r\n"), "{dsn}");
        assert!(
            dsn.contains("Diagnostic-Code: smtp;550 No such user\r\n"),
            "{dsn}"
        );
        drop(domains);
    }

    #[test]
    fn null_mx_reports_5_1_10() {
        let status: Status<(), Error> = Status::PermanentFailure(Error::NullMx);
        let mut dsn = String::new();
        status.write_dsn(&mut dsn);
        assert!(dsn.contains("Action: failed\r\n"), "{dsn}");
        assert!(dsn.contains("Status: 5.1.10\r\n"), "{dsn}");

        let mut text = String::new();
        Error::NullMx.write_dsn_text("bob@b.example", "b.example", &mut text);
        assert!(text.contains("does not accept messages (null MX)"), "{text}");
    }

    #[test]
    fn delayed_dsn_reports_retry_window() {
        let (mut domains, _) = failed_recipient();
        domains[0].status = Status::TemporaryFailure(Error::ConnectionError(ErrorDetails {
            entity: "mx.b.example".to_string(),
            details: "connection timed out".to_string(),
        }));
        let mut dsn = String::new();
        domains[0].status.write_dsn(&mut dsn);
        domains[0].write_dsn_will_retry_until(&mut dsn);

        assert!(dsn.contains("Action: delayed\r\n"), "{dsn}");
        assert!(dsn.contains("Status: 4.0.0\r\n"), "{dsn}");
        assert!(dsn.contains("Will-Retry-Until: "), "{dsn}");
    }
}
