/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use crate::dkim::parse::tags;

use super::{AlignmentMode, Dmarc, Policy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcParseError(pub String);

impl Dmarc {
    /// Selects and parses the `v=DMARC1` record from the TXT strings at
    /// `_dmarc.<domain>`. Multiple records mean none applies.
    pub fn from_txt(records: &[String]) -> Result<Option<Dmarc>, DmarcParseError> {
        let mut found = None;
        for record in records {
            let trimmed = record.trim();
            if trimmed
                .split(';')
                .next()
                .map_or(false, |v| v.trim().eq_ignore_ascii_case("v=DMARC1"))
            {
                if found.is_some() {
                    return Err(DmarcParseError(
                        "Multiple DMARC records published".to_string(),
                    ));
                }
                found = Some(Dmarc::parse(trimmed)?);
            }
        }
        Ok(found)
    }

    pub fn parse(record: &str) -> Result<Dmarc, DmarcParseError> {
        let mut policy = None;
        let mut parsed = Dmarc {
            policy: Policy::None,
            subdomain_policy: None,
            adkim: AlignmentMode::Relaxed,
            aspf: AlignmentMode::Relaxed,
            pct: 100,
            rua: Vec::new(),
            ruf: Vec::new(),
            ri: 86400,
            fo: None,
        };

        for (name, value) in tags(record) {
            match name.as_str() {
                "v" => {
                    if !value.eq_ignore_ascii_case("DMARC1") {
                        return Err(DmarcParseError(format!("Unsupported version {value:?}")));
                    }
                }
                "p" => policy = Some(parse_policy(value)?),
                "sp" => parsed.subdomain_policy = Some(parse_policy(value)?),
                "adkim" => parsed.adkim = parse_alignment(value)?,
                "aspf" => parsed.aspf = parse_alignment(value)?,
                "pct" => {
                    parsed.pct = value
                        .trim()
                        .parse::<u8>()
                        .ok()
                        .filter(|pct| *pct <= 100)
                        .ok_or_else(|| {
                            DmarcParseError(format!("pct= out of range: {value:?}"))
                        })?;
                }
                "rua" => {
                    parsed.rua = value
                        .split(',')
                        .map(|uri| uri.trim().to_string())
                        .filter(|uri| !uri.is_empty())
                        .collect();
                }
                "ruf" => {
                    parsed.ruf = value
                        .split(',')
                        .map(|uri| uri.trim().to_string())
                        .filter(|uri| !uri.is_empty())
                        .collect();
                }
                "ri" => {
                    parsed.ri = value
                        .trim()
                        .parse()
                        .map_err(|_| DmarcParseError(format!("Invalid ri= value {value:?}")))?;
                }
                "fo" => parsed.fo = Some(value.trim().to_string()),
                _ => (),
            }
        }

        parsed.policy =
            policy.ok_or_else(|| DmarcParseError("Missing required p= tag".to_string()))?;
        Ok(parsed)
    }
}

fn parse_policy(value: &str) -> Result<Policy, DmarcParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(Policy::None),
        "quarantine" => Ok(Policy::Quarantine),
        "reject" => Ok(Policy::Reject),
        other => Err(DmarcParseError(format!("Unknown policy {other:?}"))),
    }
}

fn parse_alignment(value: &str) -> Result<AlignmentMode, DmarcParseError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "r" => Ok(AlignmentMode::Relaxed),
        "s" => Ok(AlignmentMode::Strict),
        other => Err(DmarcParseError(format!("Unknown alignment {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_round_trip() {
        for record in [
            "v=DMARC1; p=reject",
            "v=DMARC1; p=none; sp=quarantine; pct=20",
            "v=DMARC1; p=quarantine; adkim=s; aspf=s; rua=mailto:agg@a.example",
            "v=DMARC1; p=reject; rua=mailto:a@x.example,mailto:b@y.example; ruf=mailto:f@x.example; ri=3600; fo=1",
        ] {
            let parsed = Dmarc::parse(record).expect(record);
            assert_eq!(
                Dmarc::parse(&parsed.to_string()).expect(record),
                parsed,
                "{record}"
            );
        }
    }

    #[test]
    fn pct_bounds_are_enforced() {
        assert!(Dmarc::parse("v=DMARC1; p=none; pct=100").is_ok());
        assert!(Dmarc::parse("v=DMARC1; p=none; pct=0").is_ok());
        assert!(Dmarc::parse("v=DMARC1; p=none; pct=101").is_err());
        assert!(Dmarc::parse("v=DMARC1; p=none; pct=-1").is_err());
    }

    #[test]
    fn missing_policy_is_an_error() {
        assert!(Dmarc::parse("v=DMARC1; sp=reject").is_err());
    }

    #[test]
    fn record_selection() {
        let records = vec![
            "something-else".to_string(),
            "v=DMARC1; p=reject".to_string(),
        ];
        assert!(Dmarc::from_txt(&records).unwrap().is_some());
        assert!(Dmarc::from_txt(&["x".to_string()]).unwrap().is_none());
        assert!(Dmarc::from_txt(&[
            "v=DMARC1; p=none".to_string(),
            "v=DMARC1; p=reject".to_string()
        ])
        .is_err());
    }
}
