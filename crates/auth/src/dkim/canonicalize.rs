/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use super::Canonicalization;

impl Canonicalization {
    /// Canonical form of one header field. `name` and `value` are the raw
    /// bytes around the colon; the result always ends with CRLF.
    pub fn header(&self, name: &[u8], value: &[u8], out: &mut Vec<u8>) {
        match self {
            Canonicalization::Simple => {
                out.extend_from_slice(name);
                out.push(b':');
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
            Canonicalization::Relaxed => {
                for byte in name {
                    if !byte.is_ascii_whitespace() {
                        out.push(byte.to_ascii_lowercase());
                    }
                }
                out.push(b':');
                let mut pending_space = false;
                let mut seen_content = false;
                for &byte in value {
                    if byte == b' ' || byte == b'\t' || byte == b'\r' || byte == b'\n' {
                        pending_space = seen_content;
                    } else {
                        if pending_space {
                            out.push(b' ');
                            pending_space = false;
                        }
                        out.push(byte);
                        seen_content = true;
                    }
                }
                out.extend_from_slice(b"\r\n");
            }
        }
    }

    /// Canonical form of the body, truncated to `length` when the signature
    /// carries `l=`.
    pub fn body(&self, body: &[u8], length: Option<usize>) -> Vec<u8> {
        let mut out = match self {
            Canonicalization::Simple => {
                let mut out = Vec::with_capacity(body.len() + 2);
                out.extend_from_slice(body);
                while out.ends_with(b"\r\n\r\n") {
                    out.truncate(out.len() - 2);
                }
                if out.is_empty() || !out.ends_with(b"\r\n") {
                    out.extend_from_slice(b"\r\n");
                }
                out
            }
            Canonicalization::Relaxed => {
                let mut out = Vec::with_capacity(body.len());
                let mut pending_space = false;
                for &byte in body {
                    match byte {
                        b' ' | b'\t' => {
                            pending_space = true;
                        }
                        b'\r' => (),
                        b'\n' => {
                            pending_space = false;
                            out.extend_from_slice(b"\r\n");
                        }
                        _ => {
                            if pending_space {
                                out.push(b' ');
                                pending_space = false;
                            }
                            out.push(byte);
                        }
                    }
                }
                if pending_space || !(out.is_empty() || out.ends_with(b"\r\n")) {
                    // Unterminated final line.
                    out.extend_from_slice(b"\r\n");
                }
                while out.ends_with(b"\r\n\r\n") {
                    out.truncate(out.len() - 2);
                }
                if out == b"\r\n" {
                    out.clear();
                }
                out
            }
        };

        if let Some(length) = length {
            if length < out.len() {
                out.truncate(length);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relaxed_header() {
        let mut out = Vec::new();
        Canonicalization::Relaxed.header(b"SUBJECT", b" AB\r\n CD \t E\r\n", &mut out);
        assert_eq!(out, b"subject:AB CD E\r\n");

        let mut out = Vec::new();
        Canonicalization::Relaxed.header(b"A", b" X ", &mut out);
        assert_eq!(out, b"a:X\r\n");
    }

    #[test]
    fn simple_header_is_verbatim() {
        let mut out = Vec::new();
        Canonicalization::Simple.header(b"Subject", b" AB\r\n CD", &mut out);
        assert_eq!(out, b"Subject: AB\r\n CD\r\n");
    }

    #[test]
    fn body_canonicalization_rfc6376_examples() {
        // RFC 6376 §3.4.5 example body " C \r\nD \t E\r\n\r\n\r\n".
        let body = b" C \r\nD \t E\r\n\r\n\r\n";
        assert_eq!(
            Canonicalization::Relaxed.body(body, None),
            b" C\r\nD E\r\n".to_vec()
        );
        assert_eq!(
            Canonicalization::Simple.body(body, None),
            b" C \r\nD \t E\r\n".to_vec()
        );
    }

    #[test]
    fn empty_bodies() {
        assert_eq!(Canonicalization::Simple.body(b"", None), b"\r\n".to_vec());
        assert_eq!(Canonicalization::Relaxed.body(b"", None), Vec::<u8>::new());
        assert_eq!(
            Canonicalization::Relaxed.body(b"\r\n\r\n", None),
            Vec::<u8>::new()
        );
    }

    #[test]
    fn body_length_truncation() {
        assert_eq!(
            Canonicalization::Simple.body(b"abcdef\r\n", Some(3)),
            b"abc".to_vec()
        );
    }
}
