/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

/// Minimal structural view of a message as it came off the wire: the raw
/// header fields in order plus the body slice. DKIM operates on these exact
/// bytes; once signed the wire form is never re-normalized.
pub struct ParsedMessage<'x> {
    pub raw: &'x [u8],
    pub headers: Vec<Header<'x>>,
    pub body: &'x [u8],
    pub body_offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Header<'x> {
    /// Field name, exactly as serialized.
    pub name: &'x [u8],
    /// Field value after the colon, including folded lines, excluding the
    /// terminating CRLF.
    pub value: &'x [u8],
    /// The complete field including name, colon and terminating CRLF.
    pub raw: &'x [u8],
}

impl<'x> ParsedMessage<'x> {
    pub fn parse(raw: &'x [u8]) -> Option<Self> {
        let mut headers = Vec::with_capacity(16);
        let mut pos = 0;

        while pos < raw.len() {
            // End of header block
            if raw[pos] == b'\r' && raw.get(pos + 1) == Some(&b'\n') {
                pos += 2;
                break;
            }
            if raw[pos] == b'\n' {
                pos += 1;
                break;
            }

            let field_start = pos;
            let mut colon = None;
            let mut field_end = raw.len();
            let mut value_end = raw.len();

            let mut offset = pos;
            while offset < raw.len() {
                match raw[offset] {
                    b':' if colon.is_none() => {
                        colon = Some(offset);
                        offset += 1;
                    }
                    b'\n' => {
                        // Folded continuation lines belong to this field.
                        match raw.get(offset + 1) {
                            Some(b' ') | Some(b'\t') => {
                                offset += 1;
                            }
                            _ => {
                                field_end = offset + 1;
                                value_end = if offset > pos && raw[offset - 1] == b'\r' {
                                    offset - 1
                                } else {
                                    offset
                                };
                                break;
                            }
                        }
                    }
                    _ => {
                        offset += 1;
                    }
                }
            }

            let colon = colon?;
            headers.push(Header {
                name: &raw[field_start..colon],
                value: &raw[colon + 1..value_end],
                raw: &raw[field_start..field_end],
            });
            pos = field_end;
            if field_end == raw.len() {
                break;
            }
        }

        if !headers.is_empty() {
            Some(ParsedMessage {
                raw,
                headers,
                body: raw.get(pos..).unwrap_or_default(),
                body_offset: pos,
            })
        } else {
            None
        }
    }

    pub fn header(&self, name: &str) -> Option<&Header<'x>> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .count()
    }

    pub fn received_count(&self) -> usize {
        self.header_count("Received")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_body() {
        let raw = b"From: alice@a.example\r\nSubject: hi\r\n there\r\nReceived: one\r\nReceived: two\r\n\r\nbody\r\n";
        let message = ParsedMessage::parse(raw).unwrap();

        assert_eq!(message.headers.len(), 4);
        assert_eq!(message.headers[0].name, b"From");
        assert_eq!(message.headers[0].value, b" alice@a.example");
        assert_eq!(message.headers[1].value, b" hi\r\n there");
        assert_eq!(message.received_count(), 2);
        assert_eq!(message.body, b"body\r\n");
        assert_eq!(
            &raw[message.body_offset..],
            b"body\r\n"
        );
    }

    #[test]
    fn message_without_body() {
        let message = ParsedMessage::parse(b"From: a@b.c\r\n").unwrap();
        assert_eq!(message.headers.len(), 1);
        assert!(message.body.is_empty());
    }
}
