/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::IpAddr, sync::Arc, time::Duration};

use common::{
    config::Rate,
    listener::limiter::{ConcurrencyLimiter, InFlight, RateLimiter},
};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Per-remote-IP budgets: concurrent connections plus sliding windows for
/// failed authentication and unknown commands. Breaching any of them closes
/// the session with 421.
pub struct IpLimits {
    entries: DashMap<IpAddr, Arc<IpEntry>, ahash::RandomState>,
}

pub struct IpEntry {
    pub concurrency: ConcurrencyLimiter,
    pub auth_failures: RateLimiter,
    pub bad_commands: RateLimiter,
}

impl IpLimits {
    pub fn new() -> Self {
        IpLimits {
            entries: DashMap::with_hasher(ahash::RandomState::default()),
        }
    }

    pub fn entry(&self, ip: IpAddr, max_connections: u64, auth_rate: &Rate, cmd_rate: &Rate) -> Arc<IpEntry> {
        self.entries
            .entry(ip)
            .or_insert_with(|| {
                Arc::new(IpEntry {
                    concurrency: ConcurrencyLimiter::new(max_connections),
                    auth_failures: RateLimiter::new(auth_rate),
                    bad_commands: RateLimiter::new(cmd_rate),
                })
            })
            .clone()
    }

    /// Returns an in-flight slot, or `None` when the IP is at its
    /// connection budget.
    pub fn connect(
        &self,
        ip: IpAddr,
        max_connections: u64,
        auth_rate: &Rate,
        cmd_rate: &Rate,
    ) -> Option<(Arc<IpEntry>, InFlight)> {
        let entry = self.entry(ip, max_connections, auth_rate, cmd_rate);
        let in_flight = entry.concurrency.is_allowed()?;
        Some((entry, in_flight))
    }

    pub fn cleanup(&self) {
        self.entries.retain(|_, entry| entry.concurrency.is_active());
    }
}

impl Default for IpLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Remembers (account, address) pairs the submission path has delivered to,
/// so inbound mail from senders nobody here ever wrote to can be slowed
/// down. Bounded; oldest entries are dropped wholesale on overflow.
pub struct KnownSenders {
    entries: Mutex<ahash::AHashSet<u64>>,
}

const MAX_KNOWN_SENDERS: usize = 100_000;

impl KnownSenders {
    pub fn new() -> Self {
        KnownSenders {
            entries: Mutex::new(ahash::AHashSet::new()),
        }
    }

    fn key(account: &str, remote: &str) -> u64 {
        use std::hash::{BuildHasher, Hash, Hasher};
        let mut hasher = ahash::RandomState::with_seeds(0x7d, 0x2c, 0x3a, 0x91).build_hasher();
        account.to_lowercase().hash(&mut hasher);
        remote.to_lowercase().hash(&mut hasher);
        hasher.finish()
    }

    pub fn record(&self, account: &str, remote: &str) {
        let mut entries = self.entries.lock();
        if entries.len() >= MAX_KNOWN_SENDERS {
            entries.clear();
        }
        entries.insert(Self::key(account, remote));
    }

    pub fn contains(&self, account: &str, remote: &str) -> bool {
        self.entries.lock().contains(&Self::key(account, remote))
    }
}

impl Default for KnownSenders {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_senders_round_trip() {
        let known = KnownSenders::new();
        assert!(!known.contains("alice", "bob@b.example"));
        known.record("alice", "bob@b.example");
        assert!(known.contains("alice", "bob@b.example"));
        assert!(known.contains("ALICE", "Bob@B.Example"));
        assert!(!known.contains("carol", "bob@b.example"));
    }

    #[test]
    fn ip_concurrency_budget() {
        let limits = IpLimits::new();
        let rate = Rate {
            requests: 10,
            period: Duration::from_secs(60),
        };
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let _a = limits.connect(ip, 2, &rate, &rate).unwrap();
        let _b = limits.connect(ip, 2, &rate, &rate).unwrap();
        assert!(limits.connect(ip, 2, &rate, &rate).is_none());
        drop(_a);
        assert!(limits.connect(ip, 2, &rate, &rate).is_some());
    }
}
