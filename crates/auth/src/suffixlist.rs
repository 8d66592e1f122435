/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use ahash::AHashSet;

/// Embedded public-suffix snapshot used to derive organizational domains for
/// DMARC relaxed alignment.
#[derive(Debug, Clone, Default)]
pub struct PublicSuffix {
    suffixes: AHashSet<String>,
    exceptions: AHashSet<String>,
    wildcards: Vec<String>,
}

static BUILTIN: &str = include_str!("../data/public_suffix.dat");

impl PublicSuffix {
    pub fn builtin() -> Self {
        Self::parse(BUILTIN)
    }

    pub fn parse(list: &str) -> Self {
        let mut ps = PublicSuffix::default();
        for line in list.lines() {
            let line = line.trim().to_lowercase();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if let Some(domain) = line.strip_prefix("*.") {
                ps.wildcards.push(format!(".{domain}"));
            } else if let Some(domain) = line.strip_prefix('!') {
                ps.exceptions.insert(domain.to_string());
            } else {
                ps.suffixes.insert(line);
            }
        }
        ps
    }

    pub fn is_public_suffix(&self, name: &str) -> bool {
        self.suffixes.contains(name)
            || (!self.exceptions.contains(name)
                && self.wildcards.iter().any(|w| {
                    // A wildcard rule covers exactly one extra label, plus
                    // the bare base which has no explicit rule of its own.
                    name == &w[1..]
                        || name
                            .strip_suffix(w.as_str())
                            .map_or(false, |label| !label.is_empty() && !label.contains('.'))
                }))
    }

    /// The registrable (organizational) domain: one label below the longest
    /// matching public suffix. A domain that is itself a public suffix, or
    /// has no suffix match at all, is returned unchanged.
    pub fn org_domain(&self, domain: &str) -> String {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        let labels = domain.split('.').collect::<Vec<_>>();
        for pos in 0..labels.len() {
            let suffix = labels[pos..].join(".");
            if self.is_public_suffix(&suffix) {
                return if pos > 0 {
                    labels[pos - 1..].join(".")
                } else {
                    domain
                };
            }
        }
        // No rule matched; treat the last label as the suffix.
        if labels.len() > 1 {
            labels[labels.len() - 2..].join(".")
        } else {
            domain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn org_domain_lookup() {
        let psl = PublicSuffix::builtin();
        for (domain, expected) in [
            ("example.com", "example.com"),
            ("mail.example.com", "example.com"),
            ("a.b.c.example.co.uk", "example.co.uk"),
            ("example.co.uk", "example.co.uk"),
            ("Example.COM.", "example.com"),
            ("www.ck", "www.ck"),
            ("shop.random.ck", "shop.random.ck"),
            ("name.unknown-tld", "name.unknown-tld"),
        ] {
            assert_eq!(psl.org_domain(domain), expected, "{domain}");
        }
    }

    #[test]
    fn wildcard_and_exception_rules() {
        let psl = PublicSuffix::parse("com\n*.ck\n!www.ck\n");
        assert!(psl.is_public_suffix("com"));
        assert!(psl.is_public_suffix("anything.ck"));
        assert!(!psl.is_public_suffix("www.ck"));
    }
}
