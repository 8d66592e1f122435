/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::fmt::Display;

use super::{Mode, MxPattern, Policy};

impl Policy {
    /// Parses the HTTPS policy body, RFC 8461 §3.2. The record id is carried
    /// over from the TXT lookup that triggered the fetch.
    pub fn parse(mut data: &str, id: String) -> Result<Policy, String> {
        let mut mode = Mode::None;
        let mut max_age: u64 = 86400;
        let mut mx = Vec::new();

        while !data.is_empty() {
            if let Some((key, next_data)) = data.split_once(':') {
                let value = if let Some((value, next_data)) = next_data.split_once('\n') {
                    data = next_data;
                    value.trim()
                } else {
                    data = "";
                    next_data.trim()
                };
                match key.trim() {
                    "mx" => {
                        if let Some(suffix) = value.strip_prefix("*.") {
                            if !suffix.is_empty() {
                                mx.push(MxPattern::StartsWith(suffix.to_lowercase()));
                            }
                        } else if !value.is_empty() {
                            mx.push(MxPattern::Equals(value.to_lowercase()));
                        }
                    }
                    "max_age" => {
                        if let Ok(value) = value.parse() {
                            max_age = value;
                        }
                    }
                    "mode" => {
                        mode = match value {
                            "enforce" => Mode::Enforce,
                            "testing" => Mode::Testing,
                            "none" => Mode::None,
                            _ => return Err(format!("Unsupported mode {value:?}.")),
                        };
                    }
                    "version" => {
                        if !value.eq_ignore_ascii_case("STSv1") {
                            return Err(format!("Unsupported version {value:?}."));
                        }
                    }
                    _ => (),
                }
            } else {
                break;
            }
        }

        if !mx.is_empty() {
            Ok(Policy {
                id,
                mode,
                mx,
                max_age,
            })
        } else {
            Err("No 'mx' entries found.".to_string())
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Enforce => "enforce",
            Mode::Testing => "testing",
            Mode::None => "none",
        })
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "version: STSv1\nmode: {}\n", self.mode)?;
        for mx in &self.mx {
            match mx {
                MxPattern::Equals(host) => writeln!(f, "mx: {host}")?,
                MxPattern::StartsWith(host) => writeln!(f, "mx: *.{host}")?,
            }
        }
        write!(f, "max_age: {}", self.max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_round_trip() {
        let text = "version: STSv1\nmode: enforce\nmx: mx.e.example\nmx: *.backup.e.example\nmax_age: 604800";
        let policy = Policy::parse(text, "id01".to_string()).unwrap();
        assert_eq!(policy.mode, Mode::Enforce);
        assert_eq!(policy.max_age, 604800);
        assert_eq!(
            policy.mx,
            vec![
                MxPattern::Equals("mx.e.example".to_string()),
                MxPattern::StartsWith("backup.e.example".to_string()),
            ]
        );
        assert_eq!(
            Policy::parse(&policy.to_string(), "id01".to_string()).unwrap(),
            policy
        );
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let text = "version: STSv1\r\nmode: testing\r\nmx: mx.e.example\r\nmax_age: 86400\r\n";
        let policy = Policy::parse(text, "id02".to_string()).unwrap();
        assert_eq!(policy.mode, Mode::Testing);
        assert_eq!(policy.mx.len(), 1);
    }

    #[test]
    fn rejects_bad_policies() {
        assert!(Policy::parse("version: STSv2\nmode: enforce\nmx: a\n", "i".to_string()).is_err());
        assert!(Policy::parse("version: STSv1\nmode: bogus\nmx: a\n", "i".to_string()).is_err());
        assert!(Policy::parse("version: STSv1\nmode: enforce\n", "i".to_string()).is_err());
    }
}
