/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Bounds the total size and message count held in the queue. References
/// release their share when dropped.
#[derive(Debug, Default)]
pub struct QuotaLimiter {
    max_size: usize,
    max_messages: usize,
    size: Arc<AtomicUsize>,
    messages: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct UsedQuota {
    size: usize,
    totals: (Arc<AtomicUsize>, Arc<AtomicUsize>),
}

impl QuotaLimiter {
    pub fn new(max_size: usize, max_messages: usize) -> Self {
        QuotaLimiter {
            max_size,
            max_messages,
            size: Arc::new(0.into()),
            messages: Arc::new(0.into()),
        }
    }

    pub fn is_allowed(&self, size: usize) -> Option<UsedQuota> {
        if self.size.load(Ordering::Relaxed) + size <= self.max_size
            && self.messages.load(Ordering::Relaxed) < self.max_messages
        {
            self.size.fetch_add(size, Ordering::Relaxed);
            self.messages.fetch_add(1, Ordering::Relaxed);
            Some(UsedQuota {
                size,
                totals: (self.size.clone(), self.messages.clone()),
            })
        } else {
            None
        }
    }
}

impl Drop for UsedQuota {
    fn drop(&mut self) {
        self.totals.0.fetch_sub(self.size, Ordering::Relaxed);
        self.totals.1.fetch_sub(1, Ordering::Relaxed);
    }
}

impl PartialEq for UsedQuota {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
    }
}

impl Eq for UsedQuota {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_released_on_drop() {
        let limiter = QuotaLimiter::new(1000, 2);
        let a = limiter.is_allowed(600).unwrap();
        assert!(limiter.is_allowed(600).is_none());
        let _b = limiter.is_allowed(300).unwrap();
        assert!(limiter.is_allowed(10).is_none());
        drop(a);
        assert!(limiter.is_allowed(600).is_some());
    }
}
