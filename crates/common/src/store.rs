/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt::Display,
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use ahash::AHashMap;
use parking_lot::Mutex;

/// Envelope data handed to the message store together with the raw bytes.
#[derive(Debug, Clone)]
pub struct DeliverEnvelope {
    pub return_path: String,
    pub recipient: String,
    pub remote_ip: String,
    pub flags: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Temporary(String),
    Permanent(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Temporary(err) => write!(f, "Temporary store error: {err}"),
            StoreError::Permanent(err) => write!(f, "Permanent store error: {err}"),
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The mailbox storage engine consumed by local delivery. The engine itself
/// is outside this repository; the core only depends on these operations.
pub trait Store: Sync + Send {
    /// Durably store `message` for `account` in `mailbox`, returning the
    /// stored message id.
    fn deliver<'a>(
        &'a self,
        account: &'a str,
        mailbox: &'a str,
        envelope: &'a DeliverEnvelope,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Resolve the account owning `address`, if any.
    fn open_account<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Option<String>>;

    /// A scratch directory for spooling partial data.
    fn create_temp_spool(&self) -> BoxFuture<'_, Result<PathBuf, StoreError>>;

    /// New-message fan-out towards IDLE-style waiters.
    fn notify(&self, account: &str);
}

/// Account credential lookups for SMTP AUTH. Secrets are returned raw so
/// challenge-response mechanisms can derive their proofs.
pub trait AccountStore: Sync + Send {
    fn secret(&self, login: &str) -> Option<String>;
    /// Addresses the login may use as MAIL FROM; entries starting with `@`
    /// whitelist the whole domain.
    fn addresses(&self, login: &str) -> Vec<String>;
}

/// In-memory store used by the test suites and local bring-up.
#[derive(Default)]
pub struct MemoryStore {
    seq: AtomicU64,
    pub accounts: AHashMap<String, String>,
    pub messages: Mutex<Vec<StoredMessage>>,
    pub fail_with: Mutex<Option<StoreError>>,
}

pub struct StoredMessage {
    pub id: u64,
    pub account: String,
    pub mailbox: String,
    pub envelope: DeliverEnvelope,
    pub message: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, address: &str, account: &str) -> Self {
        self.accounts.insert(address.to_string(), account.to_string());
        self
    }
}

impl Store for MemoryStore {
    fn deliver<'a>(
        &'a self,
        account: &'a str,
        mailbox: &'a str,
        envelope: &'a DeliverEnvelope,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            if let Some(err) = self.fail_with.lock().clone() {
                return Err(err);
            }
            let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            self.messages.lock().push(StoredMessage {
                id,
                account: account.to_string(),
                mailbox: mailbox.to_string(),
                envelope: envelope.clone(),
                message: message.to_vec(),
            });
            Ok(id)
        })
    }

    fn open_account<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            self.accounts
                .get(&address.to_lowercase())
                .cloned()
                .or_else(|| {
                    address
                        .rsplit_once('@')
                        .and_then(|(_, domain)| self.accounts.get(&format!("@{domain}")).cloned())
                })
        })
    }

    fn create_temp_spool(&self) -> BoxFuture<'_, Result<PathBuf, StoreError>> {
        Box::pin(async move {
            let path = std::env::temp_dir().join(format!(
                "maild-spool-{}",
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map_or(0, |d| d.as_nanos())
            ));
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|err| StoreError::Temporary(err.to_string()))?;
            Ok(path)
        })
    }

    fn notify(&self, _account: &str) {}
}

/// Plain filesystem store for local bring-up: one file per message under
/// `<base>/<account>/<mailbox>/`. The production storage engine is an
/// external collaborator implementing the same trait.
pub struct FsStore {
    base: PathBuf,
    seq: AtomicU64,
    pub accounts: AHashMap<String, String>,
}

impl FsStore {
    pub fn new(base: PathBuf) -> Self {
        FsStore {
            base,
            seq: AtomicU64::new(
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs()),
            ),
            accounts: AHashMap::new(),
        }
    }

    pub fn with_account(mut self, address: &str, account: &str) -> Self {
        self.accounts.insert(address.to_string(), account.to_string());
        self
    }
}

impl Store for FsStore {
    fn deliver<'a>(
        &'a self,
        account: &'a str,
        mailbox: &'a str,
        _envelope: &'a DeliverEnvelope,
        message: &'a [u8],
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let dir = self.base.join(account).join(mailbox);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|err| StoreError::Temporary(err.to_string()))?;
            let path = dir.join(format!("{id:016x}.eml"));
            tokio::fs::write(&path, message)
                .await
                .map_err(|err| StoreError::Temporary(err.to_string()))?;
            Ok(id)
        })
    }

    fn open_account<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            self.accounts
                .get(&address.to_lowercase())
                .cloned()
                .or_else(|| {
                    address
                        .rsplit_once('@')
                        .and_then(|(_, domain)| self.accounts.get(&format!("@{domain}")).cloned())
                })
        })
    }

    fn create_temp_spool(&self) -> BoxFuture<'_, Result<PathBuf, StoreError>> {
        Box::pin(async move {
            let path = self.base.join("tmp");
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|err| StoreError::Temporary(err.to_string()))?;
            Ok(path)
        })
    }

    fn notify(&self, _account: &str) {}
}

/// Static credential table for AUTH; the production directory service is an
/// external collaborator.
#[derive(Default)]
pub struct MemoryAccounts {
    pub secrets: AHashMap<String, String>,
    pub addresses: AHashMap<String, Vec<String>>,
}

impl MemoryAccounts {
    pub fn with_login(mut self, login: &str, secret: &str, addresses: &[&str]) -> Self {
        self.secrets.insert(login.to_string(), secret.to_string());
        self.addresses.insert(
            login.to_string(),
            addresses.iter().map(|a| a.to_string()).collect(),
        );
        self
    }
}

impl AccountStore for MemoryAccounts {
    fn secret(&self, login: &str) -> Option<String> {
        self.secrets.get(login).cloned()
    }

    fn addresses(&self, login: &str) -> Vec<String> {
        self.addresses.get(login).cloned().unwrap_or_default()
    }
}
