/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    borrow::Borrow,
    hash::Hash,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// Expiring cache used for positive DNS answers and MTA-STS policies.
/// Entries are served until `valid_until`; insertion past capacity evicts
/// expired entries first, then whatever expires soonest.
pub struct TtlCache<K: Hash + Eq + Clone, V: Clone> {
    entries: RwLock<AHashMap<K, TtlEntry<V>>>,
    capacity: usize,
}

struct TtlEntry<V> {
    value: V,
    valid_until: Instant,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    pub fn with_capacity(capacity: usize) -> Self {
        TtlCache {
            entries: RwLock::new(AHashMap::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entries = self.entries.read();
        entries.get(key).and_then(|entry| {
            if entry.valid_until > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: K, value: V, valid_until: Instant) -> V {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            let now = Instant::now();
            entries.retain(|_, entry| entry.valid_until > now);
            if entries.len() >= self.capacity {
                if let Some(evict) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.valid_until)
                    .map(|(key, _)| key.clone())
                {
                    entries.remove(&evict);
                }
            }
        }
        entries.insert(
            key,
            TtlEntry {
                value: value.clone(),
                valid_until,
            },
        );
        value
    }

    pub fn insert_ttl(&self, key: K, value: V, ttl: Duration) -> V {
        self.insert(key, value, Instant::now() + ttl)
    }

    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_not_served() {
        let cache = TtlCache::with_capacity(8);
        cache.insert("a".to_string(), 1u32, Instant::now() + Duration::from_secs(60));
        cache.insert("b".to_string(), 2u32, Instant::now() - Duration::from_secs(1));

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn eviction_prefers_soonest_expiry() {
        let cache = TtlCache::with_capacity(2);
        cache.insert("a".to_string(), 1u32, Instant::now() + Duration::from_secs(10));
        cache.insert("b".to_string(), 2u32, Instant::now() + Duration::from_secs(600));
        cache.insert("c".to_string(), 3u32, Instant::now() + Duration::from_secs(300));

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }
}
