/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{future::Future, net::IpAddr, pin::Pin};

use crate::{trim_dot, DnsError, Lookup};

use super::{
    macros::{self, MacroContext},
    Mechanism, SpfIdentity, SpfOutput, SpfRecord, SpfResult, MAX_DNS_LOOKUPS, MAX_MX_EXCHANGES,
    MAX_PTR_NAMES, MAX_VOID_LOOKUPS,
};

/// Evaluates the MAIL FROM identity. An empty reverse path evaluates
/// `postmaster@<helo>` per RFC 7208 §2.4 while still reporting the MAIL FROM
/// identity for alignment purposes.
pub async fn verify_spf(
    resolver: &impl Lookup,
    ip: IpAddr,
    helo: &str,
    receiver: &str,
    sender: &str,
) -> SpfOutput {
    let sender = if sender.is_empty() {
        format!("postmaster@{}", trim_dot(helo))
    } else {
        sender.to_lowercase()
    };
    let domain = sender
        .rsplit_once('@')
        .map(|(_, domain)| trim_dot(domain).to_string())
        .unwrap_or_default();
    evaluate(
        resolver,
        ip,
        helo,
        receiver,
        &sender,
        &domain,
        SpfIdentity::MailFrom,
    )
    .await
}

/// Evaluates the HELO identity.
pub async fn verify_spf_helo(
    resolver: &impl Lookup,
    ip: IpAddr,
    helo: &str,
    receiver: &str,
) -> SpfOutput {
    let domain = trim_dot(helo).to_lowercase();
    let sender = format!("postmaster@{domain}");
    evaluate(
        resolver,
        ip,
        helo,
        receiver,
        &sender,
        &domain,
        SpfIdentity::Helo,
    )
    .await
}

async fn evaluate(
    resolver: &impl Lookup,
    ip: IpAddr,
    helo: &str,
    receiver: &str,
    sender: &str,
    domain: &str,
    identity: SpfIdentity,
) -> SpfOutput {
    let none = |result: SpfResult| SpfOutput {
        result,
        domain: domain.to_string(),
        identity,
        explanation: None,
        report: None,
    };
    if domain.is_empty() || !crate::has_labels(domain) {
        return none(SpfResult::None);
    }

    let local_part = sender.rsplit_once('@').map(|(l, _)| l).unwrap_or(sender);
    let ctx = MacroContext {
        sender,
        local_part,
        sender_domain: domain,
        domain,
        ip,
        helo: trim_dot(helo),
        receiver,
    };

    let mut limits = Limits::default();
    let (result, record) = check_host(resolver, ip, domain, &ctx, &mut limits).await;

    let mut output = none(result);
    if let Some(record) = record {
        output.report = record.ra.clone();
        if result == SpfResult::Fail {
            if let Some(exp) = &record.exp {
                output.explanation = lookup_explanation(resolver, exp, &ctx, &mut limits).await;
            }
        }
    }
    output
}

#[derive(Default)]
struct Limits {
    lookups: u32,
    void_lookups: u32,
}

impl Limits {
    fn count_lookup(&mut self) -> Result<(), SpfResult> {
        self.lookups += 1;
        if self.lookups > MAX_DNS_LOOKUPS {
            Err(SpfResult::PermError)
        } else {
            Ok(())
        }
    }

    fn count_void(&mut self) -> Result<(), SpfResult> {
        self.void_lookups += 1;
        if self.void_lookups > MAX_VOID_LOOKUPS {
            Err(SpfResult::PermError)
        } else {
            Ok(())
        }
    }
}

fn check_host<'x>(
    resolver: &'x impl Lookup,
    ip: IpAddr,
    domain: &'x str,
    ctx: &'x MacroContext<'x>,
    limits: &'x mut Limits,
) -> Pin<Box<dyn Future<Output = (SpfResult, Option<SpfRecord>)> + Send + 'x>> {
    Box::pin(async move {
        let txt = match resolver.txt(domain).await {
            Ok(txt) => txt,
            Err(DnsError::NotFound) => return (SpfResult::None, None),
            Err(DnsError::Temporary(_)) => return (SpfResult::TempError, None),
            Err(DnsError::Permanent(_)) => return (SpfResult::None, None),
        };
        let record = match SpfRecord::from_txt(&txt) {
            Ok(Some(record)) => record,
            Ok(None) => return (SpfResult::None, None),
            Err(_) => return (SpfResult::PermError, None),
        };

        let result = 'eval: {
            for directive in &record.directives {
                let matched = match &directive.mechanism {
                    Mechanism::All => true,
                    Mechanism::Include { domain: spec } => {
                        if let Err(result) = limits.count_lookup() {
                            break 'eval result;
                        }
                        let target = match macros::expand(spec, ctx, false) {
                            Ok(target) => target,
                            Err(_) => break 'eval SpfResult::PermError,
                        };
                        match check_host(resolver, ip, &target, ctx, limits).await.0 {
                            SpfResult::Pass => true,
                            SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => false,
                            // An include target without a record is an error.
                            SpfResult::None | SpfResult::PermError => {
                                break 'eval SpfResult::PermError
                            }
                            SpfResult::TempError => break 'eval SpfResult::TempError,
                        }
                    }
                    Mechanism::A {
                        domain: spec,
                        ip4_mask,
                        ip6_mask,
                    } => {
                        if let Err(result) = limits.count_lookup() {
                            break 'eval result;
                        }
                        let target = match expand_or_current(spec, domain, ctx) {
                            Ok(target) => target,
                            Err(result) => break 'eval result,
                        };
                        match match_a(resolver, ip, &target, *ip4_mask, *ip6_mask, limits).await {
                            Ok(matched) => matched,
                            Err(result) => break 'eval result,
                        }
                    }
                    Mechanism::Mx {
                        domain: spec,
                        ip4_mask,
                        ip6_mask,
                    } => {
                        if let Err(result) = limits.count_lookup() {
                            break 'eval result;
                        }
                        let target = match expand_or_current(spec, domain, ctx) {
                            Ok(target) => target,
                            Err(result) => break 'eval result,
                        };
                        let exchanges = match resolver.mx(&target).await {
                            Ok(entries) => entries
                                .into_iter()
                                .flat_map(|entry| entry.exchanges)
                                .take(MAX_MX_EXCHANGES)
                                .collect::<Vec<_>>(),
                            Err(DnsError::NotFound) => {
                                if let Err(result) = limits.count_void() {
                                    break 'eval result;
                                }
                                Vec::new()
                            }
                            Err(DnsError::Temporary(_)) => break 'eval SpfResult::TempError,
                            Err(DnsError::Permanent(_)) => break 'eval SpfResult::PermError,
                        };
                        let mut matched = false;
                        for exchange in exchanges {
                            match match_a(resolver, ip, &exchange, *ip4_mask, *ip6_mask, limits)
                                .await
                            {
                                Ok(true) => {
                                    matched = true;
                                    break;
                                }
                                Ok(false) => (),
                                Err(result) => break 'eval result,
                            }
                        }
                        matched
                    }
                    Mechanism::Ptr { domain: spec } => {
                        if let Err(result) = limits.count_lookup() {
                            break 'eval result;
                        }
                        let target = match expand_or_current(spec, domain, ctx) {
                            Ok(target) => target,
                            Err(result) => break 'eval result,
                        };
                        match match_ptr(resolver, ip, &target).await {
                            Ok(matched) => matched,
                            Err(result) => break 'eval result,
                        }
                    }
                    Mechanism::Ip4 { addr, mask } => match ip {
                        IpAddr::V4(ip) => cidr4(ip, *addr, *mask),
                        IpAddr::V6(_) => false,
                    },
                    Mechanism::Ip6 { addr, mask } => match ip {
                        IpAddr::V4(_) => false,
                        IpAddr::V6(ip) => cidr6(ip, *addr, *mask),
                    },
                    Mechanism::Exists { domain: spec } => {
                        if let Err(result) = limits.count_lookup() {
                            break 'eval result;
                        }
                        let target = match macros::expand(spec, ctx, false) {
                            Ok(target) => target,
                            Err(_) => break 'eval SpfResult::PermError,
                        };
                        match resolver.ipv4(&target).await {
                            Ok(records) => !records.is_empty(),
                            Err(DnsError::NotFound) => {
                                if let Err(result) = limits.count_void() {
                                    break 'eval result;
                                }
                                false
                            }
                            Err(DnsError::Temporary(_)) => break 'eval SpfResult::TempError,
                            Err(DnsError::Permanent(_)) => break 'eval SpfResult::PermError,
                        }
                    }
                };

                if matched {
                    break 'eval directive.qualifier.result();
                }
            }

            if let Some(redirect) = &record.redirect {
                if let Err(result) = limits.count_lookup() {
                    break 'eval result;
                }
                let target = match macros::expand(redirect, ctx, false) {
                    Ok(target) => target,
                    Err(_) => break 'eval SpfResult::PermError,
                };
                match check_host(resolver, ip, &target, ctx, limits).await.0 {
                    // A missing record at the redirect target is an error.
                    SpfResult::None => SpfResult::PermError,
                    result => result,
                }
            } else {
                SpfResult::Neutral
            }
        };

        (result, Some(record))
    })
}

fn expand_or_current(
    spec: &Option<String>,
    current: &str,
    ctx: &MacroContext<'_>,
) -> Result<String, SpfResult> {
    match spec {
        Some(spec) => macros::expand(spec, ctx, false).map_err(|_| SpfResult::PermError),
        None => Ok(current.to_string()),
    }
}

async fn match_a(
    resolver: &impl Lookup,
    ip: IpAddr,
    target: &str,
    ip4_mask: u8,
    ip6_mask: u8,
    limits: &mut Limits,
) -> Result<bool, SpfResult> {
    match ip {
        IpAddr::V4(ip) => match resolver.ipv4(target).await {
            Ok(records) => Ok(records.iter().any(|addr| cidr4(ip, *addr, ip4_mask))),
            Err(DnsError::NotFound) => {
                limits.count_void()?;
                Ok(false)
            }
            Err(DnsError::Temporary(_)) => Err(SpfResult::TempError),
            Err(DnsError::Permanent(_)) => Err(SpfResult::PermError),
        },
        IpAddr::V6(ip) => match resolver.ipv6(target).await {
            Ok(records) => Ok(records.iter().any(|addr| cidr6(ip, *addr, ip6_mask))),
            Err(DnsError::NotFound) => {
                limits.count_void()?;
                Ok(false)
            }
            Err(DnsError::Temporary(_)) => Err(SpfResult::TempError),
            Err(DnsError::Permanent(_)) => Err(SpfResult::PermError),
        },
    }
}

async fn match_ptr(resolver: &impl Lookup, ip: IpAddr, target: &str) -> Result<bool, SpfResult> {
    let names = match resolver.ptr(ip).await {
        Ok(names) => names,
        // Any PTR failure means no match, never an error.
        Err(_) => return Ok(false),
    };
    let target = target.to_lowercase();
    let target_suffix = format!(".{target}");
    for name in names.iter().take(MAX_PTR_NAMES) {
        let name = trim_dot(name).to_lowercase();
        if name == target || name.ends_with(&target_suffix) {
            // Forward-confirm the PTR name.
            let confirmed = match ip {
                IpAddr::V4(ip) => resolver
                    .ipv4(&name)
                    .await
                    .map(|records| records.contains(&ip))
                    .unwrap_or(false),
                IpAddr::V6(ip) => resolver
                    .ipv6(&name)
                    .await
                    .map(|records| records.contains(&ip))
                    .unwrap_or(false),
            };
            if confirmed {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn lookup_explanation(
    resolver: &impl Lookup,
    exp: &str,
    ctx: &MacroContext<'_>,
    limits: &mut Limits,
) -> Option<String> {
    if limits.count_lookup().is_err() {
        return None;
    }
    let target = macros::expand(exp, ctx, false).ok()?;
    let txt = resolver.txt(&target).await.ok()?;
    let explanation = txt.first()?;
    macros::expand(explanation, ctx, true).ok()
}

fn cidr4(ip: std::net::Ipv4Addr, network: std::net::Ipv4Addr, mask: u8) -> bool {
    if mask >= 32 {
        ip == network
    } else {
        let mask = u32::MAX.checked_shl(32 - mask as u32).unwrap_or(0);
        (u32::from(ip) & mask) == (u32::from(network) & mask)
    }
}

fn cidr6(ip: std::net::Ipv6Addr, network: std::net::Ipv6Addr, mask: u8) -> bool {
    if mask >= 128 {
        ip == network
    } else {
        let mask = u128::MAX.checked_shl(128 - mask as u32).unwrap_or(0);
        (u128::from(ip) & mask) == (u128::from(network) & mask)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::test_support::TestLookup;

    const IP: &str = "203.0.113.9";

    fn ip() -> IpAddr {
        IP.parse().unwrap()
    }

    async fn run(resolver: &TestLookup, sender: &str) -> SpfOutput {
        verify_spf(resolver, ip(), "mail.c.example", "mx.local.example", sender).await
    }

    #[tokio::test]
    async fn hard_fail_and_explanation() {
        let resolver = TestLookup::new()
            .txt("c.example", &["v=spf1 -all exp=why.c.example"])
            .txt("why.c.example", &["%{s} is not allowed to send"]);
        let output = run(&resolver, "x@c.example").await;
        assert_eq!(output.result(), SpfResult::Fail);
        assert_eq!(
            output.explanation.as_deref(),
            Some("x@c.example is not allowed to send")
        );
    }

    #[tokio::test]
    async fn ip_and_mx_mechanisms() {
        let resolver = TestLookup::new()
            .txt("a.example", &["v=spf1 mx ip4:198.51.100.0/24 -all"])
            .mx("a.example", &[(10, "mx.a.example")])
            .a("mx.a.example", &[IP]);
        assert_eq!(
            run(&resolver, "alice@a.example").await.result(),
            SpfResult::Pass
        );

        let resolver = TestLookup::new().txt("b.example", &["v=spf1 ip4:198.51.100.0/24 ~all"]);
        assert_eq!(
            run(&resolver, "bob@b.example").await.result(),
            SpfResult::SoftFail
        );
    }

    #[tokio::test]
    async fn include_and_redirect() {
        let resolver = TestLookup::new()
            .txt("d.example", &["v=spf1 include:allow.d.example -all"])
            .txt("allow.d.example", &["v=spf1 ip4:203.0.113.0/24 -all"]);
        assert_eq!(run(&resolver, "x@d.example").await.result(), SpfResult::Pass);

        let resolver = TestLookup::new()
            .txt("e.example", &["v=spf1 redirect=other.e.example"])
            .txt("other.e.example", &["v=spf1 ip4:203.0.113.9 -all"]);
        assert_eq!(run(&resolver, "x@e.example").await.result(), SpfResult::Pass);

        // Include of a non-existent record is a permerror.
        let resolver = TestLookup::new().txt("f.example", &["v=spf1 include:gone.example -all"]);
        assert_eq!(
            run(&resolver, "x@f.example").await.result(),
            SpfResult::PermError
        );
    }

    #[tokio::test]
    async fn null_sender_uses_helo_identity() {
        let resolver = TestLookup::new().txt("mail.c.example", &["v=spf1 ip4:203.0.113.9 -all"]);
        let output = run(&resolver, "").await;
        assert_eq!(output.result(), SpfResult::Pass);
        assert_eq!(output.domain, "mail.c.example");
    }

    #[tokio::test]
    async fn lookup_limit_is_enforced() {
        // An include chain deeper than 10 evaluates to permerror without
        // issuing more than 11 record fetches.
        let mut resolver = TestLookup::new();
        for hop in 0..12 {
            let name = if hop == 0 {
                "c.example".to_string()
            } else {
                format!("hop{hop}.c.example")
            };
            resolver = resolver.txt_owned(
                &name,
                &[format!("v=spf1 include:hop{}.c.example -all", hop + 1)],
            );
        }
        let output = run(&resolver, "x@c.example").await;
        assert_eq!(output.result(), SpfResult::PermError);
        assert!(resolver.query_count() <= 11, "{}", resolver.query_count());
    }

    #[tokio::test]
    async fn void_lookup_limit_is_enforced() {
        let resolver = TestLookup::new().txt(
            "c.example",
            &["v=spf1 exists:a.void.example exists:b.void.example exists:c.void.example ip4:203.0.113.9 -all"],
        );
        assert_eq!(
            run(&resolver, "x@c.example").await.result(),
            SpfResult::PermError
        );
    }

    #[tokio::test]
    async fn temperror_propagates() {
        let resolver = TestLookup::new().tempfail("c.example");
        assert_eq!(
            run(&resolver, "x@c.example").await.result(),
            SpfResult::TempError
        );
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let resolver = TestLookup::new();
        assert_eq!(run(&resolver, "x@c.example").await.result(), SpfResult::None);
    }
}
