/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::IpAddr;

use crate::{DnsError, Lookup};

/// Reverse-DNS confirmation (iprev, RFC 8601 §2.7.3): the connecting IP has
/// a PTR name that resolves back to the same IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IprevResult {
    Pass,
    Fail,
    TempError(String),
    PermError(String),
}

impl IprevResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            IprevResult::Pass => "pass",
            IprevResult::Fail => "fail",
            IprevResult::TempError(_) => "temperror",
            IprevResult::PermError(_) => "permerror",
        }
    }
}

impl std::fmt::Display for IprevResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct IprevOutput {
    pub result: IprevResult,
    pub ptr: Vec<String>,
}

const MAX_PTR_NAMES: usize = 10;

pub async fn verify_iprev(resolver: &impl Lookup, addr: IpAddr) -> IprevOutput {
    let names = match resolver.ptr(addr).await {
        Ok(names) => names,
        Err(DnsError::NotFound) => {
            return IprevOutput {
                result: IprevResult::Fail,
                ptr: Vec::new(),
            }
        }
        Err(DnsError::Temporary(err)) => {
            return IprevOutput {
                result: IprevResult::TempError(err),
                ptr: Vec::new(),
            }
        }
        Err(DnsError::Permanent(err)) => {
            return IprevOutput {
                result: IprevResult::PermError(err),
                ptr: Vec::new(),
            }
        }
    };

    let mut result = IprevResult::Fail;
    for name in names.iter().take(MAX_PTR_NAMES) {
        let confirmed = match addr {
            IpAddr::V4(ip) => resolver
                .ipv4(name)
                .await
                .map(|records| records.contains(&ip))
                .unwrap_or(false),
            IpAddr::V6(ip) => resolver
                .ipv6(name)
                .await
                .map(|records| records.contains(&ip))
                .unwrap_or(false),
        };
        if confirmed {
            result = IprevResult::Pass;
            break;
        }
    }

    IprevOutput { result, ptr: names }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestLookup;

    #[tokio::test]
    async fn forward_confirmed_ptr_passes() {
        let resolver = TestLookup::new()
            .ptr_entry("203.0.113.9", &["mail.c.example"])
            .a("mail.c.example", &["203.0.113.9"]);
        let output = verify_iprev(&resolver, "203.0.113.9".parse().unwrap()).await;
        assert_eq!(output.result, IprevResult::Pass);
        assert_eq!(output.ptr, vec!["mail.c.example"]);
    }

    #[tokio::test]
    async fn unconfirmed_ptr_fails() {
        let resolver = TestLookup::new()
            .ptr_entry("203.0.113.9", &["mail.c.example"])
            .a("mail.c.example", &["198.51.100.1"]);
        let output = verify_iprev(&resolver, "203.0.113.9".parse().unwrap()).await;
        assert_eq!(output.result, IprevResult::Fail);
    }

    #[tokio::test]
    async fn missing_ptr_fails() {
        let output = verify_iprev(&TestLookup::new(), "203.0.113.9".parse().unwrap()).await;
        assert_eq!(output.result, IprevResult::Fail);
    }
}
