/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use crate::config::Rate;

/// Bounds concurrent sessions or deliveries; the returned `InFlight` guard
/// releases the slot on drop.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    pub max_concurrent: u64,
    pub concurrent: Arc<AtomicU64>,
}

#[derive(Default)]
pub struct InFlight {
    concurrent: Option<Arc<AtomicU64>>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: u64) -> Self {
        ConcurrencyLimiter {
            max_concurrent,
            concurrent: Arc::new(0.into()),
        }
    }

    pub fn is_allowed(&self) -> Option<InFlight> {
        if self.concurrent.load(Ordering::Relaxed) < self.max_concurrent {
            self.concurrent.fetch_add(1, Ordering::Relaxed);
            Some(InFlight {
                concurrent: Some(self.concurrent.clone()),
            })
        } else {
            None
        }
    }

    pub fn check_is_allowed(&self) -> bool {
        self.concurrent.load(Ordering::Relaxed) < self.max_concurrent
    }

    pub fn is_active(&self) -> bool {
        self.concurrent.load(Ordering::Relaxed) > 0
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(concurrent) = &self.concurrent {
            concurrent.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Sliding-window budget for failed authentications and junk commands,
/// token-bucket style with whole-window refills.
#[derive(Debug)]
pub struct RateLimiter {
    next_refill: AtomicU64,
    used: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate: &Rate) -> Self {
        RateLimiter {
            next_refill: (now() + rate.period.as_secs()).into(),
            used: 0.into(),
        }
    }

    pub fn is_allowed(&self, rate: &Rate) -> bool {
        if self.used.fetch_add(1, Ordering::Relaxed) < rate.requests {
            true
        } else {
            let now = now();
            if self.next_refill.load(Ordering::Relaxed) <= now {
                self.next_refill
                    .store(now + rate.period.as_secs(), Ordering::Relaxed);
                self.used.store(1, Ordering::Relaxed);
                true
            } else {
                false
            }
        }
    }

    pub fn secs_to_refill(&self) -> u64 {
        self.next_refill
            .load(Ordering::Relaxed)
            .saturating_sub(now())
    }
}

fn now() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn concurrency_guard_releases_on_drop() {
        let limiter = ConcurrencyLimiter::new(1);
        let guard = limiter.is_allowed().expect("first slot");
        assert!(limiter.is_allowed().is_none());
        drop(guard);
        assert!(limiter.is_allowed().is_some());
    }

    #[test]
    fn rate_limiter_blocks_after_budget() {
        let rate = Rate {
            requests: 2,
            period: Duration::from_secs(3600),
        };
        let limiter = RateLimiter::new(&rate);
        assert!(limiter.is_allowed(&rate));
        assert!(limiter.is_allowed(&rate));
        assert!(!limiter.is_allowed(&rate));
    }
}
