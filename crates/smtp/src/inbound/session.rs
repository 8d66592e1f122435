/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::{config::ServerProtocol, listener::SessionStream};
use smtp_proto::{
    request::receiver::{
        DataReceiver, DummyDataReceiver, DummyLineReceiver, LineReceiver, MAX_LINE_LENGTH,
    },
    Error, Request,
};

use crate::core::{Session, State};

use super::auth::SaslToken;

impl<T: SessionStream> Session<T> {
    /// Feeds raw bytes through the command state machine. Pipelined
    /// commands are parsed eagerly; responses go out in command order.
    /// `Ok(false)` means the client negotiated STARTTLS and the transport
    /// must be upgraded before any further byte is parsed.
    pub async fn ingest(&mut self, bytes: &[u8]) -> Result<bool, ()> {
        let mut iter = bytes.iter();
        let mut state = std::mem::replace(&mut self.state, State::None);

        'outer: loop {
            match &mut state {
                State::Request(receiver) => loop {
                    match receiver.ingest(&mut iter, bytes) {
                        Ok(request) => match request {
                            Request::Ehlo { host } => {
                                self.handle_ehlo(host, true).await?;
                            }
                            Request::Helo { host } => {
                                if self.instance.protocol == ServerProtocol::Smtp {
                                    self.handle_ehlo(host, false).await?;
                                } else {
                                    self.write(b"500 5.5.1 Invalid command.\r\n").await?;
                                }
                            }
                            Request::Mail { from } => {
                                self.handle_mail_from(from).await?;
                            }
                            Request::Rcpt { to } => {
                                self.handle_rcpt_to(to).await?;
                            }
                            Request::Data => {
                                if self.can_send_data().await? {
                                    self.write(b"354 Start mail input; end with <CRLF>.<CRLF>\r\n")
                                        .await?;
                                    self.data.message = Vec::with_capacity(1024);
                                    state = State::Data(DataReceiver::new());
                                    continue 'outer;
                                }
                            }
                            Request::Auth {
                                mechanism,
                                initial_response,
                            } => {
                                let allowed = self.allowed_mechanisms();
                                if allowed == 0 {
                                    self.write(b"503 5.5.1 AUTH not allowed.\r\n").await?;
                                } else if !self.data.authenticated_as.is_empty() {
                                    self.write(b"503 5.5.1 Already authenticated.\r\n").await?;
                                } else if let Some(mut token) =
                                    SaslToken::from_mechanism(mechanism & allowed)
                                {
                                    if self
                                        .handle_sasl_response(
                                            &mut token,
                                            initial_response.as_bytes(),
                                        )
                                        .await?
                                    {
                                        state = State::Sasl(LineReceiver::new(token));
                                        continue 'outer;
                                    }
                                } else {
                                    self.write(
                                        b"554 5.7.8 Authentication mechanism not supported.\r\n",
                                    )
                                    .await?;
                                }
                            }
                            Request::StartTls => {
                                if !self.stream.is_tls() {
                                    if self.instance.tls_acceptor.is_some() {
                                        self.write(b"220 2.0.0 Ready to start TLS.\r\n").await?;
                                        self.state = State::default();
                                        return Ok(false);
                                    } else {
                                        self.write(b"502 5.7.0 TLS not available.\r\n").await?;
                                    }
                                } else {
                                    self.write(b"504 5.7.4 Already in TLS mode.\r\n").await?;
                                }
                            }
                            Request::Rset => {
                                self.reset();
                                self.write(b"250 2.0.0 OK\r\n").await?;
                            }
                            Request::Noop { .. } => {
                                self.write(b"250 2.0.0 OK\r\n").await?;
                            }
                            Request::Quit => {
                                self.write(b"221 2.0.0 Bye.\r\n").await?;
                                return Err(());
                            }
                            Request::Help { .. } => {
                                self.write(
                                    b"250 2.0.0 Supported commands: EHLO MAIL RCPT DATA RSET NOOP QUIT STARTTLS AUTH.\r\n",
                                )
                                .await?;
                            }
                            Request::Vrfy { .. } => {
                                self.write(
                                    b"252 2.5.1 Cannot verify the user, the message will be attempted.\r\n",
                                )
                                .await?;
                            }
                            Request::Expn { .. } => {
                                self.write(b"500 5.5.1 EXPN not allowed.\r\n").await?;
                            }
                            Request::Lhlo { .. }
                            | Request::Bdat { .. }
                            | Request::Etrn { .. }
                            | Request::Atrn { .. }
                            | Request::Burl { .. } => {
                                self.write(b"502 5.5.1 Command not implemented.\r\n").await?;
                            }
                        },
                        Err(err) => match err {
                            Error::NeedsMoreData { .. } => break 'outer,
                            Error::UnknownCommand | Error::InvalidResponse { .. } => {
                                self.count_bad_command().await?;
                                self.write(b"500 5.5.1 Invalid command.\r\n").await?;
                            }
                            Error::InvalidSenderAddress => {
                                self.write(b"501 5.1.8 Bad sender's system address.\r\n")
                                    .await?;
                            }
                            Error::InvalidRecipientAddress => {
                                self.write(
                                    b"501 5.1.3 Bad destination mailbox address syntax.\r\n",
                                )
                                .await?;
                            }
                            Error::SyntaxError { syntax } => {
                                self.write(
                                    format!("501 5.5.2 Syntax error, expected: {syntax}\r\n")
                                        .as_bytes(),
                                )
                                .await?;
                            }
                            Error::InvalidParameter { param } => {
                                self.write(
                                    format!("501 5.5.4 Invalid parameter {param:?}.\r\n")
                                        .as_bytes(),
                                )
                                .await?;
                            }
                            Error::UnsupportedParameter { param } => {
                                self.write(
                                    format!("504 5.5.4 Unsupported parameter {param:?}.\r\n")
                                        .as_bytes(),
                                )
                                .await?;
                            }
                            Error::ResponseTooLong => {
                                state = State::RequestTooLarge(DummyLineReceiver::default());
                                continue 'outer;
                            }
                        },
                    }
                },
                State::Data(receiver) => {
                    if self.data.message.len() + bytes.len() < self.params.max_message_size {
                        if receiver.ingest(&mut iter, &mut self.data.message) {
                            let response = self.queue_message().await;
                            if !response.is_empty() {
                                self.write(response.as_ref()).await?;
                                self.reset();
                                state = State::default();
                            } else {
                                return Err(());
                            }
                        } else {
                            break 'outer;
                        }
                    } else {
                        state = State::DataTooLarge(DummyDataReceiver::new_data(receiver));
                    }
                }
                State::Sasl(receiver) => {
                    if receiver.ingest(&mut iter) {
                        if receiver.buf.len() < MAX_LINE_LENGTH {
                            if self
                                .handle_sasl_response(&mut receiver.state, &receiver.buf)
                                .await?
                            {
                                receiver.buf.clear();
                                continue 'outer;
                            }
                        } else {
                            self.auth_error(
                                b"500 5.5.6 Authentication Exchange line is too long.\r\n",
                            )
                            .await?;
                        }
                        state = State::default();
                    } else {
                        break 'outer;
                    }
                }
                State::DataTooLarge(receiver) => {
                    if receiver.ingest(&mut iter) {
                        tracing::debug!(parent: &self.span,
                            context = "data",
                            event = "too-large",
                            "Message exceeds maximum size.");

                        self.data.message = Vec::with_capacity(0);
                        self.write(b"552 5.3.4 Message too big for system.\r\n")
                            .await?;
                        state = State::default();
                    } else {
                        break 'outer;
                    }
                }
                State::RequestTooLarge(receiver) => {
                    if receiver.ingest(&mut iter) {
                        self.write(b"554 5.3.4 Line is too long.\r\n").await?;
                        state = State::default();
                    } else {
                        break 'outer;
                    }
                }
                State::None | State::Accepted(_) => unreachable!(),
            }
        }
        self.state = state;

        Ok(true)
    }

    /// Unknown commands count against both the session and the sliding
    /// per-IP window; abusive peers are disconnected with 421.
    async fn count_bad_command(&mut self) -> Result<(), ()> {
        self.data.bad_commands += 1;
        let cmd_rate = common::config::Rate {
            requests: self.params.bad_command_limit,
            period: std::time::Duration::from_secs(600),
        };
        let entry = self.core.ip_limits.entry(
            self.data.remote_ip,
            self.core.core.session.max_connections_per_ip,
            &self.params.auth_rate,
            &cmd_rate,
        );
        if self.data.bad_commands > self.params.bad_command_limit as u32
            || !entry.bad_commands.is_allowed(&cmd_rate)
        {
            self.write(b"421 4.7.0 Too many invalid commands, closing connection.\r\n")
                .await?;
            return Err(());
        }
        Ok(())
    }

    pub async fn can_send_data(&mut self) -> Result<bool, ()> {
        if !self.data.rcpt_to.is_empty() {
            if self.data.messages_sent < self.params.max_messages {
                Ok(true)
            } else {
                tracing::debug!(parent: &self.span,
                    context = "data",
                    event = "too-many-messages",
                    "Maximum number of messages per session exceeded.");
                self.write(b"451 4.4.5 Maximum number of messages per session exceeded.\r\n")
                    .await?;
                Ok(false)
            }
        } else {
            self.write(b"503 5.5.1 RCPT is required first.\r\n").await?;
            Ok(false)
        }
    }
}
