/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::{ListenerConfig, ServerProtocol},
    listener::limiter::ConcurrencyLimiter,
    Shutdown,
};

pub mod limiter;
pub mod stream;

pub use stream::SessionStream;

/// One bound listener socket plus everything a session needs to know about
/// the endpoint it was accepted on.
pub struct ServerInstance {
    pub id: String,
    pub protocol: ServerProtocol,
    pub hostname: String,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub tls_implicit: bool,
    /// SHA-256 of the server certificate, for tls-server-end-point channel
    /// binding.
    pub cert_fingerprint: Vec<u8>,
    pub limiter: ConcurrencyLimiter,
    pub shutdown: Shutdown,
}

/// Implemented by the protocol server; called once per accepted connection
/// on its own task.
pub trait SessionManager: Clone + Send + Sync + 'static {
    fn spawn(
        &self,
        instance: Arc<ServerInstance>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    );
}

/// Grace given to in-flight sessions once shutdown is signalled before the
/// process exits and sockets are torn down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub async fn listen(
    config: ListenerConfig,
    instance: Arc<ServerInstance>,
    manager: impl SessionManager,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(config.addr).await?;
    tracing::info!(
        context = "listener",
        event = "start",
        id = instance.id,
        bind = %config.addr,
        protocol = instance.protocol.as_str(),
    );

    let shutdown = instance.shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let local_addr = stream.local_addr().unwrap_or(config.addr);
                        manager.spawn(instance.clone(), stream, remote_addr, local_addr);
                    }
                    Err(err) => {
                        tracing::debug!(
                            context = "listener",
                            event = "error",
                            id = instance.id,
                            reason = %err,
                        );
                    }
                }
            }
            _ = shutdown.wait() => {
                tracing::info!(
                    context = "listener",
                    event = "stop",
                    id = instance.id,
                );
                return Ok(());
            }
        }
    }
}
