/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use common::{
    config::{
        tls::build_server_tls, ListenerConfig, MailAuthConfig, QueueConfig, ReportConfig,
        ServerProtocol, SessionConfig,
    },
    listener::{limiter::ConcurrencyLimiter, ServerInstance, SHUTDOWN_GRACE},
    resolver::DnsResolver,
    store::FsStore,
    Core, Inner,
};
use smtp::{core::SMTP, inbound::SmtpSessionManager, queue, SpawnServices};

/// Bootstrap from environment variables; full configuration loading belongs
/// to the management front-end, not the transfer core.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let hostname = std::env::var("MAILD_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let data_dir = PathBuf::from(
        std::env::var("MAILD_DATA").unwrap_or_else(|_| "./data".to_string()),
    );
    let smtp_addr: SocketAddr = std::env::var("MAILD_SMTP_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:25".to_string())
        .parse()
        .expect("Invalid MAILD_SMTP_LISTEN address");
    let submission_addr: SocketAddr = std::env::var("MAILD_SUBMISSION_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:587".to_string())
        .parse()
        .expect("Invalid MAILD_SUBMISSION_LISTEN address");

    let resolver = match DnsResolver::system_conf() {
        Ok(resolver) => resolver,
        Err(err) => {
            tracing::warn!("{err}, falling back to a public resolver");
            DnsResolver::cloudflare()
        }
    };

    let server_tls = match (
        std::env::var("MAILD_TLS_CERT").ok(),
        std::env::var("MAILD_TLS_KEY").ok(),
    ) {
        (Some(cert_path), Some(key_path)) => {
            let cert = std::fs::read(&cert_path).expect("Failed to read TLS certificate");
            let key = std::fs::read(&key_path).expect("Failed to read TLS key");
            Some(build_server_tls(&cert, &key).expect("Failed to build TLS configuration"))
        }
        _ => None,
    };

    let core = Arc::new(Core {
        hostname: hostname.clone(),
        session: SessionConfig::default(),
        queue: QueueConfig {
            path: data_dir.join("queue"),
            ..QueueConfig::default()
        },
        mail_auth: MailAuthConfig::default(),
        report: ReportConfig {
            path: data_dir.join("reports"),
            submitter: hostname.clone(),
            ..ReportConfig::default()
        },
        resolver,
        psl: auth::suffixlist::PublicSuffix::builtin(),
        store: Arc::new(FsStore::new(data_dir.join("store"))),
        accounts: Arc::new(common::store::MemoryAccounts::default()),
    });
    let inner = Arc::new(Inner::new());
    let shutdown = inner.shutdown.clone();

    let (smtp_core, queue_rx, report_rx) = SMTP::new(core, inner);
    smtp_core.clone().spawn_services(queue_rx, report_rx);

    // Listeners.
    let manager = SmtpSessionManager::new(smtp_core.clone());
    let (cert_fingerprint, tls_acceptor) = match server_tls {
        Some(tls) => (tls.cert_fingerprint, Some(tls.acceptor)),
        None => (Vec::new(), None),
    };
    for (id, addr, protocol) in [
        ("smtp", smtp_addr, ServerProtocol::Smtp),
        ("submission", submission_addr, ServerProtocol::Submission),
    ] {
        let config = ListenerConfig {
            id: id.to_string(),
            addr,
            protocol,
            tls_implicit: false,
            max_connections: 8192,
        };
        let instance = Arc::new(ServerInstance {
            id: id.to_string(),
            protocol,
            hostname: hostname.clone(),
            tls_acceptor: tls_acceptor.clone(),
            tls_implicit: false,
            cert_fingerprint: cert_fingerprint.clone(),
            limiter: ConcurrencyLimiter::new(config.max_connections),
            shutdown: shutdown.clone(),
        });
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = common::listener::listen(config, instance, manager).await {
                tracing::error!(
                    context = "listener",
                    event = "error",
                    id = id,
                    reason = %err,
                );
            }
        });
    }

    tracing::info!(
        context = "server",
        event = "start",
        hostname = hostname.as_str(),
        "Mail transfer core started.");

    // Graceful shutdown: stop accepting, give sessions a short grace, let
    // the queue finish its in-flight attempts.
    wait_for_signal().await;
    tracing::info!(
        context = "server",
        event = "shutdown",
        "Shutdown signal received.");
    shutdown.trigger();
    let _ = smtp_core.queue.tx.send(queue::Event::Stop).await;
    let _ = smtp_core
        .report
        .tx
        .send(smtp::reporting::Event::Stop)
        .await;
    tokio::time::sleep(SHUTDOWN_GRACE + Duration::from_millis(500)).await;
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("Failed to install signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => (),
            _ = term.recv() => (),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
