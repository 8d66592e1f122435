/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::SocketAddr, sync::Arc};

use common::listener::{ServerInstance, SessionManager, SessionStream};
use smtp_proto::request::receiver::RequestReceiver;
use tokio::net::TcpStream;

use crate::core::{Session, SessionData, SessionParameters, State, SMTP};

pub mod auth;
pub mod data;
pub mod ehlo;
pub mod mail;
pub mod rcpt;
pub mod session;

#[derive(Clone)]
pub struct SmtpSessionManager {
    pub core: Arc<SMTP>,
}

impl SmtpSessionManager {
    pub fn new(core: Arc<SMTP>) -> Self {
        SmtpSessionManager { core }
    }
}

impl SessionManager for SmtpSessionManager {
    fn spawn(
        &self,
        instance: Arc<ServerInstance>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) {
        let core = self.core.clone();
        tokio::spawn(async move {
            // Per-IP concurrency gate; refused connections get a 421.
            let config = &core.core.session;
            let cmd_rate = common::config::Rate {
                requests: config.bad_command_limit,
                period: std::time::Duration::from_secs(600),
            };
            let Some((_, in_flight)) = core.ip_limits.connect(
                remote_addr.ip(),
                config.max_connections_per_ip,
                &config.auth_rate,
                &cmd_rate,
            ) else {
                let mut stream = stream;
                let _ = tokio::io::AsyncWriteExt::write_all(
                    &mut stream,
                    b"421 4.7.0 Too many connections from your IP.\r\n",
                )
                .await;
                return;
            };

            let session_id = core.inner.cid.generate();
            let span = tracing::info_span!(
                "session",
                cid = session_id,
                remote_ip = %remote_addr.ip(),
                listener = instance.id.as_str(),
            );
            let mut session = Session {
                params: SessionParameters::resolve(&core.core.session, instance.protocol),
                data: SessionData::new(
                    local_addr.ip(),
                    local_addr.port(),
                    remote_addr.ip(),
                    remote_addr.port(),
                    session_id,
                ),
                core,
                instance,
                stream,
                span,
                state: State::default(),
                in_flight: vec![in_flight],
            };

            if session.instance.tls_implicit {
                let Some(acceptor) = session.instance.tls_acceptor.clone() else {
                    return;
                };
                match acceptor.accept(session.stream).await {
                    Ok(stream) => {
                        let mut session = session.with_stream(stream);
                        if session.greet().await.is_ok() {
                            let _ = session.io_loop().await;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(
                            context = "tls",
                            event = "handshake-failed",
                            reason = %err,
                        );
                    }
                }
            } else {
                session.run().await;
            }
        });
    }
}

/// Whether the command loop ended for good or because the client asked to
/// upgrade the transport.
#[derive(PartialEq, Eq)]
pub enum LoopExit {
    Close,
    UpgradeTls,
}

impl Session<TcpStream> {
    pub async fn run(mut self) {
        if self.greet().await.is_err() {
            return;
        }
        if self.io_loop().await == LoopExit::UpgradeTls {
            let Some(acceptor) = self.instance.tls_acceptor.clone() else {
                return;
            };
            let span = self.span.clone();
            match acceptor.accept(self.stream).await {
                Ok(stream) => {
                    // STARTTLS forgets everything learned on the plaintext
                    // transport.
                    let mut session = Session {
                        core: self.core,
                        instance: self.instance,
                        stream,
                        span,
                        state: State::Request(RequestReceiver::default()),
                        data: SessionData::new(
                            self.data.local_ip,
                            self.data.local_port,
                            self.data.remote_ip,
                            self.data.remote_port,
                            self.data.session_id,
                        ),
                        params: self.params,
                        in_flight: self.in_flight,
                    };
                    let _ = session.io_loop().await;
                }
                Err(err) => {
                    tracing::debug!(parent: &span,
                        context = "tls",
                        event = "handshake-failed",
                        reason = %err,
                    );
                }
            }
        }
    }
}

impl<T: SessionStream> Session<T> {
    fn with_stream<S: SessionStream>(self, stream: S) -> Session<S> {
        Session {
            core: self.core,
            instance: self.instance,
            stream,
            span: self.span,
            state: self.state,
            data: self.data,
            params: self.params,
            in_flight: self.in_flight,
        }
    }

    pub async fn greet(&mut self) -> Result<(), ()> {
        let hostname = self.instance.hostname.clone();
        self.write(format!("220 {hostname} ESMTP ready\r\n").as_bytes())
            .await
    }

    pub async fn io_loop(&mut self) -> LoopExit {
        let mut buf = vec![0u8; 8192];
        let shutdown = self.instance.shutdown.clone();
        let started = std::time::Instant::now();
        let duration = self.core.core.session.duration;

        loop {
            if started.elapsed() >= duration {
                let _ = self.write(b"453 4.3.2 Session open too long.\r\n").await;
                return LoopExit::Close;
            }
            let read = tokio::select! {
                read = tokio::time::timeout(self.params.timeout, self.read(&mut buf)) => read,
                _ = shutdown.wait() => {
                    let _ = self.write(b"421 4.3.0 Server shutting down.\r\n").await;
                    return LoopExit::Close;
                }
            };
            match read {
                Ok(Ok(0)) => return LoopExit::Close,
                Ok(Ok(len)) => match self.ingest(&buf[..len]).await {
                    Ok(true) => (),
                    Ok(false) => return LoopExit::UpgradeTls,
                    Err(()) => return LoopExit::Close,
                },
                Ok(Err(())) => return LoopExit::Close,
                Err(_) => {
                    let _ = self
                        .write(b"221 2.0.0 Disconnecting inactive client.\r\n")
                        .await;
                    return LoopExit::Close;
                }
            }
        }
    }
}

impl std::fmt::Debug for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LoopExit::Close => "close",
            LoopExit::UpgradeTls => "upgrade-tls",
        })
    }
}
