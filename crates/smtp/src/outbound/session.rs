/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fmt::Write, time::Duration};

use smtp_proto::{
    EhloResponse, Severity, EXT_DSN, EXT_REQUIRE_TLS, EXT_SIZE, EXT_SMTP_UTF8, MAIL_REQUIRETLS,
    MAIL_RET_FULL, MAIL_RET_HDRS, MAIL_SMTPUTF8, RCPT_NOTIFY_DELAY, RCPT_NOTIFY_FAILURE,
    RCPT_NOTIFY_NEVER, RCPT_NOTIFY_SUCCESS,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::queue::{
    Error, ErrorDetails, HostResponse, Message, Recipient, Status, RCPT_STATUS_CHANGED,
};

use super::client::SmtpClient;

pub struct DeliveryParams<'x> {
    pub hostname: &'x str,
    pub credentials: Option<(&'x str, &'x str)>,
    pub timeout_mail: Duration,
    pub timeout_rcpt: Duration,
    pub timeout_data: Duration,
}

impl Message {
    /// Drives the envelope and data phases against a connected host,
    /// recording the outcome per recipient. RCPT is issued one recipient at
    /// a time so each gets its own reply code.
    pub async fn deliver<T: AsyncRead + AsyncWrite + Unpin>(
        &self,
        mut client: SmtpClient<T>,
        capabilities: &EhloResponse<String>,
        recipients: impl Iterator<Item = &mut Recipient>,
        params: DeliveryParams<'_>,
    ) -> Status<(), Error> {
        // Relay authentication.
        if let Some((username, secret)) = params.credentials {
            if let Err(err) = client.authenticate(username, secret).await {
                tracing::info!(
                    context = "delivery",
                    event = "auth-failed",
                    hostname = params.hostname,
                    reason = %err);
                client.quit().await;
                return Status::from_client_error(params.hostname, "AUTH", err);
            }
        }

        // MAIL FROM.
        client.timeout = params.timeout_mail;
        let cmd = self.build_mail_from(capabilities);
        match client.cmd(cmd.as_bytes()).await {
            Ok(response) if response.severity() == Severity::PositiveCompletion => (),
            Ok(response) => {
                client.quit().await;
                return Status::from_client_error(
                    params.hostname,
                    &cmd,
                    super::client::ClientError::UnexpectedReply(response),
                );
            }
            Err(err) => {
                client.quit().await;
                return Status::from_client_error(params.hostname, &cmd, err);
            }
        }

        // RCPT TO, one per recipient to capture per-recipient codes.
        let mut total_rcpt = 0;
        let mut total_completed = 0;
        let mut accepted_rcpts = Vec::new();
        client.timeout = params.timeout_rcpt;
        for rcpt in recipients {
            total_rcpt += 1;
            if matches!(
                &rcpt.status,
                Status::Completed(_) | Status::PermanentFailure(_)
            ) {
                total_completed += 1;
                continue;
            }

            let cmd = self.build_rcpt_to(rcpt, capabilities);
            match client.cmd(cmd.as_bytes()).await {
                Ok(response) => match response.severity() {
                    Severity::PositiveCompletion => {
                        accepted_rcpts.push((
                            rcpt,
                            Status::Completed(HostResponse {
                                hostname: params.hostname.to_string(),
                                response,
                            }),
                        ));
                    }
                    severity => {
                        tracing::info!(
                            context = "delivery",
                            event = "rcpt-rejected",
                            hostname = params.hostname,
                            rcpt = rcpt.address.as_str(),
                            response = %response);
                        let response = HostResponse {
                            hostname: ErrorDetails {
                                entity: params.hostname.to_string(),
                                details: cmd.trim().to_string(),
                            },
                            response,
                        };
                        rcpt.flags |= RCPT_STATUS_CHANGED;
                        rcpt.status = if severity == Severity::PermanentNegativeCompletion {
                            total_completed += 1;
                            Status::PermanentFailure(response)
                        } else {
                            Status::TemporaryFailure(response)
                        };
                    }
                },
                Err(err) => {
                    client.quit().await;
                    return Status::from_client_error(params.hostname, "", err);
                }
            }
        }

        // DATA.
        if !accepted_rcpts.is_empty() {
            let raw_message = match self.read_spooled_message().await {
                Ok(raw_message) => raw_message,
                Err(err) => {
                    client.quit().await;
                    return Status::TemporaryFailure(Error::Io(err));
                }
            };
            client.timeout = params.timeout_data;
            if let Err(err) = client
                .send_message(None, &raw_message, params.timeout_data)
                .await
            {
                client.quit().await;
                return Status::from_client_error(params.hostname, "DATA", err);
            }
            match client.read_response().await {
                Ok(response) if response.code() == 250 => {
                    for (rcpt, status) in accepted_rcpts {
                        tracing::info!(
                            context = "delivery",
                            event = "delivered",
                            hostname = params.hostname,
                            rcpt = rcpt.address.as_str());
                        rcpt.status = status;
                        rcpt.flags |= RCPT_STATUS_CHANGED;
                        total_completed += 1;
                    }
                }
                Ok(response) => {
                    client.quit().await;
                    return Status::from_client_error(
                        params.hostname,
                        "DATA",
                        super::client::ClientError::UnexpectedReply(response),
                    );
                }
                Err(err) => {
                    client.quit().await;
                    return Status::from_client_error(params.hostname, "DATA", err);
                }
            }
        }

        client.quit().await;
        if total_completed == total_rcpt {
            Status::Completed(())
        } else {
            Status::Scheduled
        }
    }

    fn build_mail_from(&self, capabilities: &EhloResponse<String>) -> String {
        let mut mail_from = String::with_capacity(self.return_path.len() + 60);
        let _ = write!(mail_from, "MAIL FROM:<{}>", self.return_path);
        if capabilities.has_capability(EXT_SIZE) {
            let _ = write!(mail_from, " SIZE={}", self.size);
        }
        if self.has_flag(MAIL_REQUIRETLS) && capabilities.has_capability(EXT_REQUIRE_TLS) {
            mail_from.push_str(" REQUIRETLS");
        }
        if self.has_flag(MAIL_SMTPUTF8) && capabilities.has_capability(EXT_SMTP_UTF8) {
            mail_from.push_str(" SMTPUTF8");
        }
        if capabilities.has_capability(EXT_DSN) {
            if self.has_flag(MAIL_RET_FULL) {
                mail_from.push_str(" RET=FULL");
            } else if self.has_flag(MAIL_RET_HDRS) {
                mail_from.push_str(" RET=HDRS");
            }
            if let Some(env_id) = &self.env_id {
                let _ = write!(mail_from, " ENVID={env_id}");
            }
        }
        mail_from.push_str("\r\n");
        mail_from
    }

    fn build_rcpt_to(&self, rcpt: &Recipient, capabilities: &EhloResponse<String>) -> String {
        let mut rcpt_to = String::with_capacity(rcpt.address.len() + 60);
        let _ = write!(rcpt_to, "RCPT TO:<{}>", rcpt.address);
        if capabilities.has_capability(EXT_DSN) {
            if rcpt.has_flag(RCPT_NOTIFY_SUCCESS | RCPT_NOTIFY_FAILURE | RCPT_NOTIFY_DELAY) {
                rcpt_to.push_str(" NOTIFY=");
                let mut add_comma = if rcpt.has_flag(RCPT_NOTIFY_SUCCESS) {
                    rcpt_to.push_str("SUCCESS");
                    true
                } else {
                    false
                };
                if rcpt.has_flag(RCPT_NOTIFY_DELAY) {
                    if add_comma {
                        rcpt_to.push(',');
                    } else {
                        add_comma = true;
                    }
                    rcpt_to.push_str("DELAY");
                }
                if rcpt.has_flag(RCPT_NOTIFY_FAILURE) {
                    if add_comma {
                        rcpt_to.push(',');
                    }
                    rcpt_to.push_str("FAILURE");
                }
            } else if rcpt.has_flag(RCPT_NOTIFY_NEVER) {
                rcpt_to.push_str(" NOTIFY=NEVER");
            }
            if let Some(orcpt) = &rcpt.orcpt {
                let _ = write!(rcpt_to, " ORCPT=rfc822;{orcpt}");
            }
        }
        rcpt_to.push_str("\r\n");
        rcpt_to
    }
}
