/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::{pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey};

use super::{Algorithm, Canonicalization, DkimError, DomainKey, PublicKey, Signature};

/// Splits a tag-list (`k=v; k=v`) keeping values verbatim; folding
/// whitespace is the caller's concern per tag.
pub(crate) fn tags(value: &str) -> impl Iterator<Item = (String, &str)> {
    value.split(';').filter_map(|tag| {
        let (name, value) = tag.split_once('=')?;
        Some((name.trim().to_ascii_lowercase(), value.trim()))
    })
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|ch| !ch.is_whitespace()).collect()
}

fn decode_base64(value: &str) -> Result<Vec<u8>, DkimError> {
    STANDARD
        .decode(strip_whitespace(value))
        .map_err(|err| DkimError(format!("Invalid base64: {err}")))
}

impl Signature {
    pub fn parse(header_value: &[u8]) -> Result<Signature, DkimError> {
        let value = std::str::from_utf8(header_value)
            .map_err(|_| DkimError("Signature header is not UTF-8".to_string()))?;

        let mut version = None;
        let mut algorithm = None;
        let mut domain = None;
        let mut selector = None;
        let mut header_canon = Canonicalization::Simple;
        let mut body_canon = Canonicalization::Simple;
        let mut headers = Vec::new();
        let mut body_hash = None;
        let mut signature = None;
        let mut timestamp = 0;
        let mut expiration = 0;
        let mut identity = None;
        let mut body_length = None;

        for (name, value) in tags(value) {
            match name.as_str() {
                "v" => version = Some(value.to_string()),
                "a" => {
                    algorithm = Some(match strip_whitespace(value).to_ascii_lowercase().as_str() {
                        "rsa-sha256" => Algorithm::RsaSha256,
                        "rsa-sha1" => Algorithm::RsaSha1,
                        "ed25519-sha256" => Algorithm::Ed25519Sha256,
                        other => {
                            return Err(DkimError(format!("Unsupported algorithm {other:?}")))
                        }
                    })
                }
                "d" => domain = Some(strip_whitespace(value).to_lowercase()),
                "s" => selector = Some(strip_whitespace(value).to_lowercase()),
                "c" => {
                    let value = strip_whitespace(value).to_ascii_lowercase();
                    let (header, body) = value.split_once('/').unwrap_or((value.as_str(), "simple"));
                    header_canon = parse_canon(header)?;
                    body_canon = parse_canon(body)?;
                }
                "h" => {
                    headers = strip_whitespace(value)
                        .split(':')
                        .map(|h| h.to_string())
                        .filter(|h| !h.is_empty())
                        .collect();
                }
                "bh" => body_hash = Some(decode_base64(value)?),
                "b" => signature = Some(decode_base64(value)?),
                "t" => {
                    timestamp = strip_whitespace(value)
                        .parse()
                        .map_err(|_| DkimError("Invalid t= value".to_string()))?
                }
                "x" => {
                    expiration = strip_whitespace(value)
                        .parse()
                        .map_err(|_| DkimError("Invalid x= value".to_string()))?
                }
                "i" => identity = Some(strip_whitespace(value)),
                "l" => {
                    body_length = Some(
                        strip_whitespace(value)
                            .parse()
                            .map_err(|_| DkimError("Invalid l= value".to_string()))?,
                    )
                }
                _ => (),
            }
        }

        match version.as_deref() {
            Some("1") => (),
            Some(other) => return Err(DkimError(format!("Unsupported version {other:?}"))),
            None => return Err(DkimError("Missing v= tag".to_string())),
        }
        let signature = Signature {
            algorithm: algorithm.ok_or_else(|| DkimError("Missing a= tag".to_string()))?,
            domain: domain
                .filter(|d| !d.is_empty())
                .ok_or_else(|| DkimError("Missing d= tag".to_string()))?,
            selector: selector
                .filter(|s| !s.is_empty())
                .ok_or_else(|| DkimError("Missing s= tag".to_string()))?,
            header_canon,
            body_canon,
            headers,
            body_hash: body_hash.ok_or_else(|| DkimError("Missing bh= tag".to_string()))?,
            signature: signature.ok_or_else(|| DkimError("Missing b= tag".to_string()))?,
            timestamp,
            expiration,
            identity,
            body_length,
        };

        if !signature
            .headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case("from"))
        {
            return Err(DkimError("h= does not cover the From header".to_string()));
        }
        if signature.expiration != 0
            && signature.timestamp != 0
            && signature.expiration < signature.timestamp
        {
            return Err(DkimError("x= predates t=".to_string()));
        }
        if let Some(identity) = &signature.identity {
            let identity_domain = identity.rsplit_once('@').map(|(_, d)| d).unwrap_or(identity);
            let identity_domain = identity_domain.to_lowercase();
            if identity_domain != signature.domain
                && !identity_domain.ends_with(&format!(".{}", signature.domain))
            {
                return Err(DkimError("i= is not within d=".to_string()));
            }
        }

        Ok(signature)
    }
}

fn parse_canon(value: &str) -> Result<Canonicalization, DkimError> {
    match value {
        "simple" => Ok(Canonicalization::Simple),
        "relaxed" => Ok(Canonicalization::Relaxed),
        other => Err(DkimError(format!("Unknown canonicalization {other:?}"))),
    }
}

impl DomainKey {
    /// Parses the TXT record set published at `<selector>._domainkey.<domain>`.
    pub fn from_txt(records: &[String]) -> Result<DomainKey, DkimError> {
        let record = records
            .iter()
            .find(|r| {
                let r = r.trim();
                r.starts_with("v=DKIM1") || r.contains("p=")
            })
            .ok_or_else(|| DkimError("No key record found".to_string()))?;
        Self::parse(record)
    }

    pub fn parse(record: &str) -> Result<DomainKey, DkimError> {
        let mut key_type = "rsa".to_string();
        let mut public_key_data = None;
        let mut hashes = Vec::new();
        let mut strict = false;
        let mut testing = false;

        for (name, value) in tags(record) {
            match name.as_str() {
                "v" => {
                    if !value.eq_ignore_ascii_case("DKIM1") {
                        return Err(DkimError(format!("Unsupported key version {value:?}")));
                    }
                }
                "k" => key_type = strip_whitespace(value).to_ascii_lowercase(),
                "p" => public_key_data = Some(strip_whitespace(value)),
                "h" => {
                    hashes = strip_whitespace(value)
                        .split(':')
                        .map(|h| h.to_ascii_lowercase())
                        .collect()
                }
                "t" => {
                    for flag in strip_whitespace(value).split(':') {
                        match flag {
                            "y" => testing = true,
                            "s" => strict = true,
                            _ => (),
                        }
                    }
                }
                _ => (),
            }
        }

        let public_key_data =
            public_key_data.ok_or_else(|| DkimError("Missing p= tag".to_string()))?;
        let public_key = if public_key_data.is_empty() {
            PublicKey::Revoked
        } else {
            let der = decode_base64(&public_key_data)?;
            match key_type.as_str() {
                "rsa" => rsa::RsaPublicKey::from_public_key_der(&der)
                    .or_else(|_| rsa::RsaPublicKey::from_pkcs1_der(&der))
                    .map(PublicKey::Rsa)
                    .map_err(|err| DkimError(format!("Invalid RSA public key: {err}")))?,
                "ed25519" => ed25519_dalek::VerifyingKey::from_bytes(
                    der.as_slice()
                        .try_into()
                        .map_err(|_| DkimError("Invalid Ed25519 key length".to_string()))?,
                )
                .map(PublicKey::Ed25519)
                .map_err(|err| DkimError(format!("Invalid Ed25519 public key: {err}")))?,
                other => return Err(DkimError(format!("Unsupported key type {other:?}"))),
            }
        };

        Ok(DomainKey {
            public_key,
            hashes,
            strict,
            testing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signature_header() {
        let value = b" v=1; a=rsa-sha256; c=relaxed/simple; d=Example.COM;\r\n\ts=sel; t=1577836800; x=1577923200; h=From : To:Subject;\r\n\tbh=MTIzNDU2Nzg5MDEyMzQ1Njc4OTAxMjM0NTY3ODkwMTI=;\r\n\tb=dGVzdA==";
        let signature = Signature::parse(value).unwrap();
        assert_eq!(signature.algorithm, Algorithm::RsaSha256);
        assert_eq!(signature.domain, "example.com");
        assert_eq!(signature.selector, "sel");
        assert_eq!(signature.header_canon, Canonicalization::Relaxed);
        assert_eq!(signature.body_canon, Canonicalization::Simple);
        assert_eq!(signature.headers, vec!["From", "To", "Subject"]);
        assert_eq!(signature.timestamp, 1577836800);
        assert_eq!(signature.expiration, 1577923200);
        assert_eq!(signature.signature, b"test");
    }

    #[test]
    fn rejects_signature_without_from() {
        let value = b"v=1; a=rsa-sha256; d=example.com; s=sel; h=To:Subject; bh=dGVzdA==; b=dGVzdA==";
        assert!(Signature::parse(value).is_err());
    }

    #[test]
    fn rejects_misaligned_identity() {
        let value = b"v=1; a=rsa-sha256; d=example.com; s=sel; h=From; i=@other.example; bh=dGVzdA==; b=dGVzdA==";
        assert!(Signature::parse(value).is_err());
    }

    #[test]
    fn parses_key_record_flags() {
        let record = "v=DKIM1; k=rsa; t=y:s; h=sha256; p=";
        let key = DomainKey::parse(record).unwrap();
        assert!(matches!(key.public_key, PublicKey::Revoked));
        assert!(key.testing);
        assert!(key.strict);
        assert_eq!(key.hashes, vec!["sha256"]);
    }
}
