/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use super::{Directive, Mechanism, Qualifier, SpfRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfParseError(pub String);

impl SpfRecord {
    /// Selects the `v=spf1` record among the TXT strings at a domain.
    /// Returns `Err` when more than one record is published, which evaluates
    /// to permerror.
    pub fn from_txt(records: &[String]) -> Result<Option<SpfRecord>, SpfParseError> {
        let mut found = None;
        for record in records {
            let trimmed = record.trim();
            if trimmed.len() >= 6 && trimmed[..6].eq_ignore_ascii_case("v=spf1") {
                // "v=spf1" must be a whole term.
                if trimmed.len() > 6 && !trimmed.as_bytes()[6].is_ascii_whitespace() {
                    continue;
                }
                if found.is_some() {
                    return Err(SpfParseError("Multiple SPF records published".to_string()));
                }
                found = Some(SpfRecord::parse(trimmed)?);
            }
        }
        Ok(found)
    }

    pub fn parse(record: &str) -> Result<SpfRecord, SpfParseError> {
        let mut terms = record.split_ascii_whitespace();
        match terms.next() {
            Some(version) if version.eq_ignore_ascii_case("v=spf1") => (),
            _ => return Err(SpfParseError("Not an SPF record".to_string())),
        }

        let mut parsed = SpfRecord {
            directives: Vec::new(),
            redirect: None,
            exp: None,
            ra: None,
            modifiers: Vec::new(),
        };

        for term in terms {
            // Modifiers use '=' before any ':' or '/'.
            if let Some((name, value)) = term.split_once('=') {
                if !name.contains(':') && !name.contains('/') {
                    let name_lc = name.to_ascii_lowercase();
                    match name_lc.as_str() {
                        "redirect" => {
                            check_domain_spec(value)?;
                            if parsed.redirect.replace(value.to_string()).is_some() {
                                return Err(SpfParseError(
                                    "Duplicate redirect modifier".to_string(),
                                ));
                            }
                        }
                        "exp" => {
                            check_domain_spec(value)?;
                            parsed.exp = Some(value.to_string());
                        }
                        "ra" => {
                            parsed.ra = Some(value.to_string());
                        }
                        _ => {
                            parsed.modifiers.push((name_lc, value.to_string()));
                        }
                    }
                    continue;
                }
            }

            let (qualifier, mechanism) = match term.as_bytes().first() {
                Some(b'+') => (Qualifier::Pass, &term[1..]),
                Some(b'-') => (Qualifier::Fail, &term[1..]),
                Some(b'~') => (Qualifier::SoftFail, &term[1..]),
                Some(b'?') => (Qualifier::Neutral, &term[1..]),
                Some(_) => (Qualifier::Pass, term),
                None => continue,
            };
            parsed.directives.push(Directive {
                qualifier,
                mechanism: Mechanism::parse(mechanism)?,
            });
        }

        Ok(parsed)
    }
}

impl Mechanism {
    fn parse(term: &str) -> Result<Mechanism, SpfParseError> {
        let (name, argument) = term
            .split_once(':')
            .map(|(n, a)| (n, Some(a)))
            .unwrap_or_else(|| {
                term.split_once('/')
                    .map(|(n, _)| (n, None))
                    .unwrap_or((term, None))
            });
        let cidr = term.split_once('/').map(|(_, c)| c);

        match name.to_ascii_lowercase().as_str() {
            "all" => {
                if argument.is_none() && cidr.is_none() {
                    Ok(Mechanism::All)
                } else {
                    Err(SpfParseError(format!("Invalid all mechanism {term:?}")))
                }
            }
            "include" => Ok(Mechanism::Include {
                domain: required_domain(argument, cidr, term)?,
            }),
            "exists" => Ok(Mechanism::Exists {
                domain: required_domain(argument, cidr, term)?,
            }),
            "a" => {
                let (domain, ip4_mask, ip6_mask) = domain_dual_cidr(argument, cidr, term)?;
                Ok(Mechanism::A {
                    domain,
                    ip4_mask,
                    ip6_mask,
                })
            }
            "mx" => {
                let (domain, ip4_mask, ip6_mask) = domain_dual_cidr(argument, cidr, term)?;
                Ok(Mechanism::Mx {
                    domain,
                    ip4_mask,
                    ip6_mask,
                })
            }
            "ptr" => {
                if cidr.is_some() {
                    return Err(SpfParseError(format!("Invalid ptr mechanism {term:?}")));
                }
                let domain = match argument {
                    Some(domain) => {
                        check_domain_spec(domain)?;
                        Some(domain.to_string())
                    }
                    None => None,
                };
                Ok(Mechanism::Ptr { domain })
            }
            "ip4" => {
                let argument = argument
                    .ok_or_else(|| SpfParseError(format!("Missing address in {term:?}")))?;
                let (addr, mask) = match argument.split_once('/') {
                    Some((addr, mask)) => (addr, parse_mask(mask, 32, term)?),
                    None => (argument, 32),
                };
                Ok(Mechanism::Ip4 {
                    addr: addr
                        .parse()
                        .map_err(|_| SpfParseError(format!("Invalid ip4 address {term:?}")))?,
                    mask,
                })
            }
            "ip6" => {
                let argument = argument
                    .ok_or_else(|| SpfParseError(format!("Missing address in {term:?}")))?;
                let (addr, mask) = match argument.split_once('/') {
                    Some((addr, mask)) => (addr, parse_mask(mask, 128, term)?),
                    None => (argument, 128),
                };
                Ok(Mechanism::Ip6 {
                    addr: addr
                        .parse()
                        .map_err(|_| SpfParseError(format!("Invalid ip6 address {term:?}")))?,
                    mask,
                })
            }
            _ => Err(SpfParseError(format!("Unknown mechanism {term:?}"))),
        }
    }
}

fn required_domain(
    argument: Option<&str>,
    cidr: Option<&str>,
    term: &str,
) -> Result<String, SpfParseError> {
    if cidr.is_some() {
        return Err(SpfParseError(format!("Unexpected CIDR in {term:?}")));
    }
    let domain =
        argument.ok_or_else(|| SpfParseError(format!("Missing domain-spec in {term:?}")))?;
    check_domain_spec(domain)?;
    Ok(domain.to_string())
}

fn domain_dual_cidr(
    argument: Option<&str>,
    _cidr: Option<&str>,
    term: &str,
) -> Result<(Option<String>, u8, u8), SpfParseError> {
    // Strip any dual-cidr suffix from the argument first: "a:d.com/24//64".
    let mut domain = None;
    let mut remainder = "";
    if let Some(argument) = argument {
        match argument.split_once('/') {
            Some((name, rest)) => {
                domain = (!name.is_empty()).then(|| name.to_string());
                remainder = rest;
            }
            None => {
                domain = (!argument.is_empty()).then(|| argument.to_string());
            }
        }
    } else if let Some((_, rest)) = term.split_once('/') {
        remainder = rest;
    }
    if let Some(domain) = &domain {
        check_domain_spec(domain)?;
    }

    let (mut ip4_mask, mut ip6_mask) = (32u8, 128u8);
    if !remainder.is_empty() {
        // The first '/' was consumed above, so "domain//64" leaves "/64".
        if let Some(v6) = remainder.strip_prefix('/') {
            ip6_mask = parse_mask(v6, 128, term)?;
        } else {
            let (v4, v6) = match remainder.split_once("//") {
                Some((v4, v6)) => (v4, Some(v6)),
                None => (remainder, None),
            };
            ip4_mask = parse_mask(v4, 32, term)?;
            if let Some(v6) = v6 {
                ip6_mask = parse_mask(v6, 128, term)?;
            }
        }
    }
    Ok((domain, ip4_mask, ip6_mask))
}

fn parse_mask(mask: &str, max: u8, term: &str) -> Result<u8, SpfParseError> {
    mask.parse::<u8>()
        .ok()
        .filter(|mask| *mask <= max)
        .ok_or_else(|| SpfParseError(format!("Invalid CIDR length in {term:?}")))
}

/// Light validation only: macro escapes must be balanced, expansion happens
/// at evaluation time.
fn check_domain_spec(spec: &str) -> Result<(), SpfParseError> {
    let mut bytes = spec.bytes();
    while let Some(ch) = bytes.next() {
        if ch == b'%' {
            match bytes.next() {
                Some(b'{') => {
                    for ch in bytes.by_ref() {
                        if ch == b'}' {
                            break;
                        }
                    }
                }
                Some(b'%') | Some(b'_') | Some(b'-') => (),
                _ => return Err(SpfParseError(format!("Invalid macro escape in {spec:?}"))),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_round_trip() {
        for record in [
            "v=spf1 -all",
            "v=spf1 mx -all",
            "v=spf1 a mx ip4:192.0.2.0/24 ip6:2001:db8::/32 -all",
            "v=spf1 include:_spf.example.com ~all",
            "v=spf1 a:mail.example.com/28 mx/30//64 a:mail.example.net//96 exists:%{i}.rbl.example.org ?all",
            "v=spf1 ptr:example.net -exists:%{l}.lookup.example.net redirect=_spf.example.net",
            "v=spf1 -all exp=explain._spf.%{d}",
        ] {
            let parsed = SpfRecord::parse(record).expect(record);
            assert_eq!(
                SpfRecord::parse(&parsed.to_string()).expect(record),
                parsed,
                "{record}"
            );
        }
    }

    #[test]
    fn rejects_malformed_records() {
        for record in [
            "v=spf2 -all",
            "v=spf1 ip4:bad-address",
            "v=spf1 ip4:192.0.2.1/48",
            "v=spf1 frobnicate",
            "v=spf1 include",
            "v=spf1 all:argument",
        ] {
            assert!(SpfRecord::parse(record).is_err(), "{record}");
        }
    }

    #[test]
    fn selects_single_record_from_txt() {
        let records = vec![
            "other txt".to_string(),
            "v=spf1 -all".to_string(),
            "v=spf10 x".to_string(),
        ];
        assert!(SpfRecord::from_txt(&records).unwrap().is_some());

        let records = vec!["v=spf1 -all".to_string(), "v=spf1 +all".to_string()];
        assert!(SpfRecord::from_txt(&records).is_err());

        assert!(SpfRecord::from_txt(&["plain".to_string()]).unwrap().is_none());
    }
}
