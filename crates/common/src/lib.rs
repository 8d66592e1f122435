/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    cid::{CidGenerator, ReceivedToken},
    config::{MailAuthConfig, QueueConfig, ReportConfig, SessionConfig},
    resolver::DnsResolver,
    store::{AccountStore, Store},
};

pub mod cache;
pub mod cid;
pub mod config;
pub mod listener;
pub mod resolver;
pub mod sleep;
pub mod store;

pub const USER_AGENT: &str = "maild/0.1";
pub const DAEMON_NAME: &str = "maild";

/// Read-only configuration and capabilities shared by every task. Replaced
/// wholesale on reload via an `ArcSwap` in the caller.
pub struct Core {
    pub hostname: String,
    pub session: SessionConfig,
    pub queue: QueueConfig,
    pub mail_auth: MailAuthConfig,
    pub report: ReportConfig,
    pub resolver: DnsResolver,
    pub psl: auth::suffixlist::PublicSuffix,
    pub store: Arc<dyn Store>,
    pub accounts: Arc<dyn AccountStore>,
}

/// Mutable process-wide state that survives configuration reloads.
pub struct Inner {
    pub cid: CidGenerator,
    pub received_token: ReceivedToken,
    pub shutdown: Shutdown,
}

impl Inner {
    pub fn new() -> Self {
        Inner {
            cid: CidGenerator::new(),
            received_token: ReceivedToken::generate(),
            shutdown: Shutdown::new(),
        }
    }
}

impl Default for Inner {
    fn default() -> Self {
        Self::new()
    }
}

/// Process shutdown signal. Listeners stop accepting when triggered, sessions
/// and the queue manager observe it through cloned receivers.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown { tx, rx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
