/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt::Write,
    net::IpAddr,
    time::SystemTime,
};

/// Session values macro expansion draws from, RFC 7208 §7.
pub struct MacroContext<'x> {
    pub sender: &'x str,
    pub local_part: &'x str,
    pub sender_domain: &'x str,
    pub domain: &'x str,
    pub ip: IpAddr,
    pub helo: &'x str,
    pub receiver: &'x str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroError(pub String);

/// Expands `spec` against the context. `in_exp` additionally permits the
/// c/r/t letters that are only valid inside explanation strings.
pub fn expand(spec: &str, ctx: &MacroContext<'_>, in_exp: bool) -> Result<String, MacroError> {
    let mut expanded = String::with_capacity(spec.len());
    let mut chars = spec.chars();

    while let Some(ch) = chars.next() {
        if ch != '%' {
            expanded.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => expanded.push('%'),
            Some('_') => expanded.push(' '),
            Some('-') => expanded.push_str("%20"),
            Some('{') => {
                let mut letter = None;
                let mut digits = String::new();
                let mut reverse = false;
                let mut delimiters = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    match ch {
                        '}' => {
                            closed = true;
                            break;
                        }
                        _ if letter.is_none() => letter = Some(ch),
                        '0'..='9' if delimiters.is_empty() && !reverse => digits.push(ch),
                        'r' | 'R' if !reverse => reverse = true,
                        '.' | '-' | '+' | ',' | '/' | '_' | '=' => delimiters.push(ch),
                        _ => return Err(MacroError(format!("Invalid macro in {spec:?}"))),
                    }
                }
                if !closed {
                    return Err(MacroError(format!("Unterminated macro in {spec:?}")));
                }
                let letter =
                    letter.ok_or_else(|| MacroError(format!("Empty macro in {spec:?}")))?;
                let url_escape = letter.is_ascii_uppercase();
                let value = match letter.to_ascii_lowercase() {
                    's' => ctx.sender.to_string(),
                    'l' => ctx.local_part.to_string(),
                    'o' => ctx.sender_domain.to_string(),
                    'd' => ctx.domain.to_string(),
                    'i' => match ctx.ip {
                        IpAddr::V4(ip) => ip.to_string(),
                        IpAddr::V6(ip) => {
                            let mut nibbles = String::with_capacity(63);
                            for byte in ip.octets() {
                                if !nibbles.is_empty() {
                                    nibbles.push('.');
                                }
                                let _ = write!(nibbles, "{:x}.{:x}", byte >> 4, byte & 0xf);
                            }
                            nibbles
                        }
                    },
                    'v' => match ctx.ip {
                        IpAddr::V4(_) => "in-addr".to_string(),
                        IpAddr::V6(_) => "ip6".to_string(),
                    },
                    'h' => ctx.helo.to_string(),
                    // Validated-domain lookups are deliberately not
                    // performed; RFC 7208 §7.3 allows "unknown".
                    'p' => "unknown".to_string(),
                    'c' if in_exp => ctx.ip.to_string(),
                    'r' if in_exp => ctx.receiver.to_string(),
                    't' if in_exp => SystemTime::now()
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .map_or(0, |d| d.as_secs())
                        .to_string(),
                    _ => return Err(MacroError(format!("Unknown macro letter in {spec:?}"))),
                };

                let value = transform(&value, &digits, reverse, &delimiters);
                if url_escape {
                    for ch in value.chars() {
                        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_' | '~') {
                            expanded.push(ch);
                        } else {
                            let mut buf = [0u8; 4];
                            for byte in ch.encode_utf8(&mut buf).bytes() {
                                let _ = write!(expanded, "%{byte:02x}");
                            }
                        }
                    }
                } else {
                    expanded.push_str(&value);
                }
            }
            _ => return Err(MacroError(format!("Invalid macro escape in {spec:?}"))),
        }
    }

    Ok(expanded)
}

fn transform(value: &str, digits: &str, reverse: bool, delimiters: &str) -> String {
    let delimiters = if delimiters.is_empty() {
        "."
    } else {
        delimiters
    };
    let mut parts = value
        .split(|ch| delimiters.contains(ch))
        .collect::<Vec<_>>();
    if reverse {
        parts.reverse();
    }
    if let Ok(keep) = digits.parse::<usize>() {
        if keep > 0 && keep < parts.len() {
            parts = parts.split_off(parts.len() - keep);
        }
    }
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(ip: IpAddr) -> MacroContext<'static> {
        MacroContext {
            sender: "strong-bad@email.example.com",
            local_part: "strong-bad",
            sender_domain: "email.example.com",
            domain: "email.example.com",
            ip,
            helo: "mail.example.org",
            receiver: "mx.example.net",
        }
    }

    #[test]
    fn rfc7208_examples() {
        let ctx4 = ctx("192.0.2.3".parse().unwrap());
        for (spec, expected) in [
            ("%{s}", "strong-bad@email.example.com"),
            ("%{o}", "email.example.com"),
            ("%{d}", "email.example.com"),
            ("%{d4}", "email.example.com"),
            ("%{d3}", "email.example.com"),
            ("%{d2}", "example.com"),
            ("%{d1}", "com"),
            ("%{dr}", "com.example.email"),
            ("%{d2r}", "example.email"),
            ("%{l}", "strong-bad"),
            ("%{l-}", "strong.bad"),
            ("%{lr}", "strong-bad"),
            ("%{lr-}", "bad.strong"),
            ("%{l1r-}", "strong"),
            (
                "%{ir}.%{v}._spf.%{d2}",
                "3.2.0.192.in-addr._spf.example.com",
            ),
            ("%{lr-}.lp._spf.%{d2}", "bad.strong.lp._spf.example.com"),
            ("%{d2}.trusted-domains.example.net", "example.com.trusted-domains.example.net"),
        ] {
            assert_eq!(expand(spec, &ctx4, false).unwrap(), expected, "{spec}");
        }
    }

    #[test]
    fn ipv6_nibble_expansion() {
        let ctx6 = ctx("2001:db8::cb01".parse().unwrap());
        assert_eq!(
            expand("%{ir}.%{v}._spf.%{d2}", &ctx6, false).unwrap(),
            "1.0.b.c.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6._spf.example.com"
        );
    }

    #[test]
    fn exp_only_macros_rejected_in_domain_spec() {
        let ctx4 = ctx("192.0.2.3".parse().unwrap());
        assert!(expand("%{c}", &ctx4, false).is_err());
        assert!(expand("%{c}", &ctx4, true).is_ok());
        assert!(expand("%{z}", &ctx4, false).is_err());
        assert!(expand("%{d", &ctx4, false).is_err());
    }
}
