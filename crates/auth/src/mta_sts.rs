/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::Display;

use crate::dkim::parse::tags;

/// The `_mta-sts.<domain>` TXT record. The policy body itself is fetched
/// over HTTPS by the outbound path when `id` changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtaStsRecord {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtaStsParseError(pub String);

impl MtaStsRecord {
    pub fn from_txt(records: &[String]) -> Result<Option<MtaStsRecord>, MtaStsParseError> {
        let mut found = None;
        for record in records {
            let trimmed = record.trim();
            if trimmed
                .split(';')
                .next()
                .map_or(false, |v| v.trim().eq_ignore_ascii_case("v=STSv1"))
            {
                if found.is_some() {
                    return Err(MtaStsParseError(
                        "Multiple MTA-STS records published".to_string(),
                    ));
                }
                found = Some(MtaStsRecord::parse(trimmed)?);
            }
        }
        Ok(found)
    }

    pub fn parse(record: &str) -> Result<MtaStsRecord, MtaStsParseError> {
        let mut id = None;
        for (name, value) in tags(record) {
            match name.as_str() {
                "v" => {
                    if !value.eq_ignore_ascii_case("STSv1") {
                        return Err(MtaStsParseError(format!(
                            "Unsupported version {value:?}"
                        )));
                    }
                }
                "id" => {
                    let value = value.trim();
                    if value.is_empty() || !value.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                        return Err(MtaStsParseError(format!("Invalid id {value:?}")));
                    }
                    id = Some(value.to_string());
                }
                _ => (),
            }
        }
        Ok(MtaStsRecord {
            id: id.ok_or_else(|| MtaStsParseError("Missing id= tag".to_string()))?,
        })
    }
}

impl Display for MtaStsRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v=STSv1; id={}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_round_trip() {
        let record = MtaStsRecord::parse("v=STSv1; id=20240801T010101").unwrap();
        assert_eq!(record.id, "20240801T010101");
        assert_eq!(MtaStsRecord::parse(&record.to_string()).unwrap(), record);

        assert!(MtaStsRecord::parse("v=STSv1").is_err());
        assert!(MtaStsRecord::parse("v=STSv1; id=white space").is_err());
        assert!(MtaStsRecord::parse("v=STSv2; id=a").is_err());
    }

    #[test]
    fn txt_selection() {
        let records = vec!["other".to_string(), "v=STSv1; id=abc123".to_string()];
        assert_eq!(
            MtaStsRecord::from_txt(&records).unwrap().unwrap().id,
            "abc123"
        );
        assert!(MtaStsRecord::from_txt(&["plain".to_string()])
            .unwrap()
            .is_none());
    }
}
