/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

/// DNSSEC-authenticated TLSA set for one MX host, reduced to the DANE
/// usages (2 and 3); PKIX usages are not actionable for SMTP, RFC 7672 §3.1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tlsa {
    pub entries: Vec<TlsaEntry>,
    pub has_end_entities: bool,
    pub has_intermediates: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TlsaEntry {
    /// DANE-EE (usage 3) when true, DANE-TA (usage 2) otherwise.
    pub is_end_entity: bool,
    /// SHA2-256 match when true, SHA2-512 otherwise. Full-data entries are
    /// dropped at lookup time.
    pub is_sha256: bool,
    /// SPKI selector when true, full certificate otherwise.
    pub is_spki: bool,
    pub data: Vec<u8>,
}
