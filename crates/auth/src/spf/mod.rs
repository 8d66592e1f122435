/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt::{Display, Write},
    net::{Ipv4Addr, Ipv6Addr},
};

pub mod macros;
pub mod parse;
pub mod verify;

/// Evaluation limits from RFC 7208 §4.6.4.
pub const MAX_DNS_LOOKUPS: u32 = 10;
pub const MAX_VOID_LOOKUPS: u32 = 2;
pub const MAX_PTR_NAMES: usize = 10;
pub const MAX_MX_EXCHANGES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

impl Display for SpfResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which envelope identity was evaluated; DMARC alignment checks the domain
/// of the identity that produced a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfIdentity {
    MailFrom,
    Helo,
}

#[derive(Debug, Clone)]
pub struct SpfOutput {
    pub result: SpfResult,
    /// Domain of the evaluated identity.
    pub domain: String,
    pub identity: SpfIdentity,
    /// Expanded `exp=` text, present on fail when the record provides one.
    pub explanation: Option<String>,
    /// Local part of the `ra=` reporting modifier, when present.
    pub report: Option<String>,
}

impl SpfOutput {
    pub fn result(&self) -> SpfResult {
        self.result
    }

    pub fn report_address(&self) -> Option<String> {
        self.report
            .as_ref()
            .map(|local| format!("{}@{}", local, self.domain))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfRecord {
    pub directives: Vec<Directive>,
    pub redirect: Option<String>,
    pub exp: Option<String>,
    pub ra: Option<String>,
    /// Unrecognized modifiers, kept verbatim.
    pub modifiers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    pub fn result(&self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

/// Domain specs are stored unexpanded; macros evaluate against the live
/// session in `verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Include {
        domain: String,
    },
    A {
        domain: Option<String>,
        ip4_mask: u8,
        ip6_mask: u8,
    },
    Mx {
        domain: Option<String>,
        ip4_mask: u8,
        ip6_mask: u8,
    },
    Ptr {
        domain: Option<String>,
    },
    Ip4 {
        addr: Ipv4Addr,
        mask: u8,
    },
    Ip6 {
        addr: Ipv6Addr,
        mask: u8,
    },
    Exists {
        domain: String,
    },
}

impl Display for Qualifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Qualifier::Pass => Ok(()),
            Qualifier::Fail => f.write_char('-'),
            Qualifier::SoftFail => f.write_char('~'),
            Qualifier::Neutral => f.write_char('?'),
        }
    }
}

fn write_dual_cidr(
    f: &mut std::fmt::Formatter<'_>,
    name: &str,
    domain: &Option<String>,
    ip4_mask: u8,
    ip6_mask: u8,
) -> std::fmt::Result {
    f.write_str(name)?;
    if let Some(domain) = domain {
        write!(f, ":{domain}")?;
    }
    if ip4_mask != 32 {
        write!(f, "/{ip4_mask}")?;
    }
    if ip6_mask != 128 {
        write!(f, "//{ip6_mask}")?;
    }
    Ok(())
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::All => f.write_str("all"),
            Mechanism::Include { domain } => write!(f, "include:{domain}"),
            Mechanism::A {
                domain,
                ip4_mask,
                ip6_mask,
            } => write_dual_cidr(f, "a", domain, *ip4_mask, *ip6_mask),
            Mechanism::Mx {
                domain,
                ip4_mask,
                ip6_mask,
            } => write_dual_cidr(f, "mx", domain, *ip4_mask, *ip6_mask),
            Mechanism::Ptr { domain } => {
                f.write_str("ptr")?;
                if let Some(domain) = domain {
                    write!(f, ":{domain}")?;
                }
                Ok(())
            }
            Mechanism::Ip4 { addr, mask } => {
                write!(f, "ip4:{addr}")?;
                if *mask != 32 {
                    write!(f, "/{mask}")?;
                }
                Ok(())
            }
            Mechanism::Ip6 { addr, mask } => {
                write!(f, "ip6:{addr}")?;
                if *mask != 128 {
                    write!(f, "/{mask}")?;
                }
                Ok(())
            }
            Mechanism::Exists { domain } => write!(f, "exists:{domain}"),
        }
    }
}

impl Display for SpfRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("v=spf1")?;
        for directive in &self.directives {
            write!(f, " {}{}", directive.qualifier, directive.mechanism)?;
        }
        if let Some(redirect) = &self.redirect {
            write!(f, " redirect={redirect}")?;
        }
        if let Some(exp) = &self.exp {
            write!(f, " exp={exp}")?;
        }
        if let Some(ra) = &self.ra {
            write!(f, " ra={ra}")?;
        }
        for (name, value) in &self.modifiers {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}
