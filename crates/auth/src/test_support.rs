/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::atomic::{AtomicUsize, Ordering},
};

use ahash::{AHashMap, AHashSet};

use crate::{DnsError, Lookup, MxEntry};

/// Deterministic zone data for evaluator tests.
#[derive(Default)]
pub struct TestLookup {
    txt: AHashMap<String, Vec<String>>,
    ipv4: AHashMap<String, Vec<Ipv4Addr>>,
    ipv6: AHashMap<String, Vec<Ipv6Addr>>,
    mx: AHashMap<String, Vec<MxEntry>>,
    ptr: AHashMap<String, Vec<String>>,
    tempfail: AHashSet<String>,
    queries: AtomicUsize,
}

impl TestLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn txt(mut self, name: &str, records: &[&str]) -> Self {
        self.txt.insert(
            name.to_lowercase(),
            records.iter().map(|r| r.to_string()).collect(),
        );
        self
    }

    pub fn txt_owned(mut self, name: &str, records: &[String]) -> Self {
        self.txt.insert(name.to_lowercase(), records.to_vec());
        self
    }

    pub fn a(mut self, name: &str, addrs: &[&str]) -> Self {
        self.ipv4.insert(
            name.to_lowercase(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }

    pub fn aaaa(mut self, name: &str, addrs: &[&str]) -> Self {
        self.ipv6.insert(
            name.to_lowercase(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }

    pub fn mx(mut self, name: &str, entries: &[(u16, &str)]) -> Self {
        let mut records: Vec<MxEntry> = Vec::new();
        for (preference, exchange) in entries {
            match records.iter_mut().find(|e| e.preference == *preference) {
                Some(entry) => entry.exchanges.push(exchange.to_string()),
                None => records.push(MxEntry {
                    preference: *preference,
                    exchanges: vec![exchange.to_string()],
                }),
            }
        }
        self.mx.insert(name.to_lowercase(), records);
        self
    }

    pub fn ptr_entry(mut self, addr: &str, names: &[&str]) -> Self {
        self.ptr.insert(
            addr.to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        );
        self
    }

    pub fn tempfail(mut self, name: &str) -> Self {
        self.tempfail.insert(name.to_lowercase());
        self
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    fn fetch<T: Clone>(
        &self,
        map: &AHashMap<String, Vec<T>>,
        name: &str,
    ) -> Result<Vec<T>, DnsError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let name = name.trim_end_matches('.').to_lowercase();
        if self.tempfail.contains(&name) {
            return Err(DnsError::Temporary("SERVFAIL".to_string()));
        }
        map.get(&name).cloned().ok_or(DnsError::NotFound)
    }
}

impl Lookup for TestLookup {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.fetch(&self.txt, name)
    }

    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.fetch(&self.ipv4, name)
    }

    async fn ipv6(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.fetch(&self.ipv6, name)
    }

    async fn mx(&self, name: &str) -> Result<Vec<MxEntry>, DnsError> {
        self.fetch(&self.mx, name)
    }

    async fn ptr(&self, addr: IpAddr) -> Result<Vec<String>, DnsError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.ptr
            .get(&addr.to_string())
            .cloned()
            .ok_or(DnsError::NotFound)
    }
}
