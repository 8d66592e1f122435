/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::Display;

pub mod parse;
pub mod verify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::None => "none",
            Policy::Quarantine => "quarantine",
            Policy::Reject => "reject",
        }
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `adkim=`/`aspf=` alignment requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

impl Display for AlignmentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AlignmentMode::Relaxed => "r",
            AlignmentMode::Strict => "s",
        })
    }
}

/// How an identity aligned with the From domain, ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Alignment {
    None,
    Relaxed,
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dmarc {
    pub policy: Policy,
    pub subdomain_policy: Option<Policy>,
    pub adkim: AlignmentMode,
    pub aspf: AlignmentMode,
    pub pct: u8,
    pub rua: Vec<String>,
    pub ruf: Vec<String>,
    /// Aggregate report interval in seconds.
    pub ri: u32,
    pub fo: Option<String>,
}

impl Dmarc {
    /// The policy applying to `domain` given the record was found at
    /// `record_domain`; subdomains use `sp=` when present.
    pub fn effective_policy(&self, is_subdomain: bool) -> Policy {
        if is_subdomain {
            self.subdomain_policy.unwrap_or(self.policy)
        } else {
            self.policy
        }
    }

    pub fn requests_reports(&self) -> bool {
        !self.rua.is_empty()
    }
}

impl Display for Dmarc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v=DMARC1; p={}", self.policy)?;
        if let Some(sp) = &self.subdomain_policy {
            write!(f, "; sp={sp}")?;
        }
        if self.adkim != AlignmentMode::Relaxed {
            write!(f, "; adkim={}", self.adkim)?;
        }
        if self.aspf != AlignmentMode::Relaxed {
            write!(f, "; aspf={}", self.aspf)?;
        }
        if self.pct != 100 {
            write!(f, "; pct={}", self.pct)?;
        }
        if !self.rua.is_empty() {
            write!(f, "; rua={}", self.rua.join(","))?;
        }
        if !self.ruf.is_empty() {
            write!(f, "; ruf={}", self.ruf.join(","))?;
        }
        if self.ri != 86400 {
            write!(f, "; ri={}", self.ri)?;
        }
        if let Some(fo) = &self.fo {
            write!(f, "; fo={fo}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmarcResult {
    Pass,
    Fail,
    None,
    TempError(String),
    PermError(String),
}

impl DmarcResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmarcResult::Pass => "pass",
            DmarcResult::Fail => "fail",
            DmarcResult::None => "none",
            DmarcResult::TempError(_) => "temperror",
            DmarcResult::PermError(_) => "permerror",
        }
    }
}

impl Display for DmarcResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the full DMARC evaluation for one message.
#[derive(Debug, Clone)]
pub struct DmarcOutput {
    pub record: Option<std::sync::Arc<Dmarc>>,
    /// Domain the record was found at (the From domain or its
    /// organizational domain).
    pub domain: String,
    pub result: DmarcResult,
    /// Per-identifier outcomes after applying the record's alignment modes.
    pub dkim_result: DmarcResult,
    pub spf_result: DmarcResult,
    /// Effective disposition after `pct=` sampling.
    pub policy: Policy,
    /// Strongest alignment produced by any authenticated identifier.
    pub alignment: Alignment,
}

impl DmarcOutput {
    pub fn result(&self) -> &DmarcResult {
        &self.result
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn requests_reports(&self) -> bool {
        self.record.as_ref().map_or(false, |r| r.requests_reports())
    }
}
