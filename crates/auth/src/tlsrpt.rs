/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::Display;

use crate::dkim::parse::tags;

/// The `_smtp._tls.<domain>` reporting record, RFC 8460.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRptRecord {
    pub rua: Vec<ReportUri>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportUri {
    Mail(String),
    Http(String),
}

impl ReportUri {
    pub fn parse(uri: &str) -> Option<ReportUri> {
        let uri = uri.trim();
        if let Some(addr) = uri.strip_prefix("mailto:") {
            (!addr.is_empty()).then(|| ReportUri::Mail(addr.to_string()))
        } else if uri.starts_with("https://") {
            Some(ReportUri::Http(uri.to_string()))
        } else {
            None
        }
    }
}

impl Display for ReportUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportUri::Mail(addr) => write!(f, "mailto:{addr}"),
            ReportUri::Http(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRptParseError(pub String);

impl TlsRptRecord {
    pub fn from_txt(records: &[String]) -> Result<Option<TlsRptRecord>, TlsRptParseError> {
        let mut found = None;
        for record in records {
            let trimmed = record.trim();
            if trimmed
                .split(';')
                .next()
                .map_or(false, |v| v.trim().eq_ignore_ascii_case("v=TLSRPTv1"))
            {
                if found.is_some() {
                    return Err(TlsRptParseError(
                        "Multiple TLSRPT records published".to_string(),
                    ));
                }
                found = Some(TlsRptRecord::parse(trimmed)?);
            }
        }
        Ok(found)
    }

    pub fn parse(record: &str) -> Result<TlsRptRecord, TlsRptParseError> {
        let mut rua = Vec::new();
        for (name, value) in tags(record) {
            match name.as_str() {
                "v" => {
                    if !value.eq_ignore_ascii_case("TLSRPTv1") {
                        return Err(TlsRptParseError(format!(
                            "Unsupported version {value:?}"
                        )));
                    }
                }
                "rua" => {
                    for uri in value.split(',') {
                        rua.push(ReportUri::parse(uri).ok_or_else(|| {
                            TlsRptParseError(format!("Invalid report URI {uri:?}"))
                        })?);
                    }
                }
                _ => (),
            }
        }
        if rua.is_empty() {
            return Err(TlsRptParseError("Missing rua= tag".to_string()));
        }
        Ok(TlsRptRecord { rua })
    }
}

impl Display for TlsRptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("v=TLSRPTv1; rua=")?;
        for (pos, uri) in self.rua.iter().enumerate() {
            if pos > 0 {
                f.write_str(",")?;
            }
            uri.fmt(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_round_trip() {
        for record in [
            "v=TLSRPTv1; rua=mailto:tls-reports@a.example",
            "v=TLSRPTv1; rua=mailto:a@x.example,https://reports.example/submit",
        ] {
            let parsed = TlsRptRecord::parse(record).expect(record);
            assert_eq!(
                TlsRptRecord::parse(&parsed.to_string()).expect(record),
                parsed,
                "{record}"
            );
        }
    }

    #[test]
    fn rejects_bad_records() {
        assert!(TlsRptRecord::parse("v=TLSRPTv1").is_err());
        assert!(TlsRptRecord::parse("v=TLSRPTv1; rua=gopher://x").is_err());
        assert!(TlsRptRecord::parse("v=TLSRPTv2; rua=mailto:a@b.c").is_err());
    }
}
