/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

pub mod dane;
pub mod dkim;
pub mod dmarc;
pub mod iprev;
pub mod message;
pub mod report;
pub mod mta_sts;
pub mod spf;
pub mod suffixlist;
#[cfg(test)]
pub(crate) mod test_support;
pub mod tlsrpt;

/// DNS outcome classification shared by every policy evaluator. Not-found is
/// distinct from failure; temporary and permanent failures map to the
/// tempfail/permfail legs of the policy state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    NotFound,
    Temporary(String),
    Permanent(String),
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::NotFound => f.write_str("record not found"),
            DnsError::Temporary(err) => write!(f, "temporary DNS failure: {err}"),
            DnsError::Permanent(err) => write!(f, "permanent DNS failure: {err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxEntry {
    pub preference: u16,
    pub exchanges: Vec<String>,
}

/// DNS capability consumed by the evaluators, so a test harness can
/// substitute a deterministic resolver.
pub trait Lookup: Sync + Send {
    fn txt(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn ipv4(&self, name: &str) -> impl Future<Output = Result<Vec<Ipv4Addr>, DnsError>> + Send;
    fn ipv6(&self, name: &str) -> impl Future<Output = Result<Vec<Ipv6Addr>, DnsError>> + Send;
    fn mx(&self, name: &str) -> impl Future<Output = Result<Vec<MxEntry>, DnsError>> + Send;
    fn ptr(&self, addr: IpAddr) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

pub(crate) fn trim_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// Simple FQDN shape check: at least one dot-separated label pair.
pub fn has_labels(name: &str) -> bool {
    let name = trim_dot(name);
    name.split_once('.')
        .map_or(false, |(a, b)| !a.is_empty() && !b.is_empty())
}
