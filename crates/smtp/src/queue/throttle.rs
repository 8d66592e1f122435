/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::limiter::{ConcurrencyLimiter, InFlight};
use dashmap::DashMap;

/// Bounds concurrent delivery attempts per recipient domain. Failure hands
/// back the limiter so the manager can park the message until a slot frees.
pub struct DomainThrottle {
    entries: DashMap<String, ConcurrencyLimiter, ahash::RandomState>,
    max_concurrent: u64,
}

impl DomainThrottle {
    pub fn new(max_concurrent: usize) -> Self {
        DomainThrottle {
            entries: DashMap::with_hasher(ahash::RandomState::default()),
            max_concurrent: max_concurrent as u64,
        }
    }

    pub fn acquire(&self, domain: &str) -> Result<InFlight, ConcurrencyLimiter> {
        let limiter = self
            .entries
            .entry(domain.to_string())
            .or_insert_with(|| ConcurrencyLimiter::new(self.max_concurrent))
            .clone();
        limiter.is_allowed().ok_or(limiter)
    }

    pub fn cleanup(&self) {
        self.entries.retain(|_, limiter| limiter.is_active());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_domain_slots() {
        let throttle = DomainThrottle::new(1);
        let slot = throttle.acquire("b.example").unwrap();
        assert!(throttle.acquire("b.example").is_err());
        assert!(throttle.acquire("c.example").is_ok());
        drop(slot);
        assert!(throttle.acquire("b.example").is_ok());
    }
}
