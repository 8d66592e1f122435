/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::Display;

pub mod canonicalize;
pub mod parse;
pub mod sign;
pub mod verify;

pub use sign::DkimSigner;

/// Maximum number of DKIM-Signature headers evaluated per message; the rest
/// are ignored to bound adversarial input.
pub const MAX_SIGNATURES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha256,
    /// Verification only, kept for legacy signers.
    RsaSha1,
    Ed25519Sha256,
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Algorithm::RsaSha256 => "rsa-sha256",
            Algorithm::RsaSha1 => "rsa-sha1",
            Algorithm::Ed25519Sha256 => "ed25519-sha256",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Canonicalization {
    #[default]
    Simple,
    Relaxed,
}

impl Display for Canonicalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        })
    }
}

/// A parsed `DKIM-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: Algorithm,
    pub domain: String,
    pub selector: String,
    pub header_canon: Canonicalization,
    pub body_canon: Canonicalization,
    pub headers: Vec<String>,
    pub body_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub timestamp: u64,
    pub expiration: u64,
    pub identity: Option<String>,
    pub body_length: Option<usize>,
}

impl Signature {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// A parsed `<selector>._domainkey.<domain>` key record.
#[derive(Debug, Clone)]
pub struct DomainKey {
    pub public_key: PublicKey,
    /// Acceptable hash algorithms from `h=`; empty means all.
    pub hashes: Vec<String>,
    /// `t=s`: the `i=` domain must not be a subdomain.
    pub strict: bool,
    /// `t=y`: domain is testing DKIM.
    pub testing: bool,
}

#[derive(Clone)]
pub enum PublicKey {
    Rsa(rsa::RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
    /// `p=` was empty: the key is revoked.
    Revoked,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PublicKey::Rsa(_) => "PublicKey::Rsa",
            PublicKey::Ed25519(_) => "PublicKey::Ed25519",
            PublicKey::Revoked => "PublicKey::Revoked",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DkimResult {
    Pass,
    None,
    Neutral(String),
    Fail(String),
    PermError(String),
    TempError(String),
}

impl DkimResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DkimResult::Pass => "pass",
            DkimResult::None => "none",
            DkimResult::Neutral(_) => "neutral",
            DkimResult::Fail(_) => "fail",
            DkimResult::PermError(_) => "permerror",
            DkimResult::TempError(_) => "temperror",
        }
    }
}

impl Display for DkimResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DkimResult::Pass => f.write_str("pass"),
            DkimResult::None => f.write_str("none"),
            DkimResult::Neutral(err) => write!(f, "neutral ({err})"),
            DkimResult::Fail(err) => write!(f, "fail ({err})"),
            DkimResult::PermError(err) => write!(f, "permerror ({err})"),
            DkimResult::TempError(err) => write!(f, "temperror ({err})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DkimOutput {
    pub result: DkimResult,
    pub signature: Option<Signature>,
}

impl DkimOutput {
    pub fn result(&self) -> &DkimResult {
        &self.result
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn is_pass(&self) -> bool {
        matches!(self.result, DkimResult::Pass)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimError(pub String);

impl Display for DkimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
