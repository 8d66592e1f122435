/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fmt::Write, time::SystemTime};

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::Signer;
use rsa::{
    pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, Pkcs1v15Sign, RsaPrivateKey,
};
use sha2::{Digest, Sha256};

use crate::message::ParsedMessage;

use super::{Algorithm, Canonicalization, DkimError};

/// Headers included in outbound signatures unless overridden: the standard
/// originator and threading fields.
pub const DEFAULT_SIGNED_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "reply-to",
    "subject",
    "date",
    "message-id",
    "in-reply-to",
    "references",
    "mime-version",
    "content-type",
];

enum SigningKey {
    RsaSha256(Box<RsaPrivateKey>),
    Ed25519(Box<ed25519_dalek::SigningKey>),
}

/// A configured signer for one (domain, selector, key) tuple. Keys are
/// loaded once at start-up.
pub struct DkimSigner {
    key: SigningKey,
    pub domain: String,
    pub selector: String,
    headers: Vec<String>,
    header_canon: Canonicalization,
    body_canon: Canonicalization,
    expire_after: Option<u64>,
}

impl DkimSigner {
    pub fn from_rsa_pem(pem: &str, domain: &str, selector: &str) -> Result<Self, DkimError> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|err| DkimError(format!("Failed to read RSA key: {err}")))?;
        Ok(Self::new(SigningKey::RsaSha256(Box::new(key)), domain, selector))
    }

    pub fn from_ed25519_pem(pem: &str, domain: &str, selector: &str) -> Result<Self, DkimError> {
        let key = ed25519_dalek::SigningKey::from_pkcs8_pem(pem)
            .map_err(|err| DkimError(format!("Failed to read Ed25519 key: {err}")))?;
        Ok(Self::new(SigningKey::Ed25519(Box::new(key)), domain, selector))
    }

    pub fn from_rsa_key(key: RsaPrivateKey, domain: &str, selector: &str) -> Self {
        Self::new(SigningKey::RsaSha256(Box::new(key)), domain, selector)
    }

    pub fn from_ed25519_key(
        key: ed25519_dalek::SigningKey,
        domain: &str,
        selector: &str,
    ) -> Self {
        Self::new(SigningKey::Ed25519(Box::new(key)), domain, selector)
    }

    fn new(key: SigningKey, domain: &str, selector: &str) -> Self {
        DkimSigner {
            key,
            domain: domain.to_lowercase(),
            selector: selector.to_lowercase(),
            headers: DEFAULT_SIGNED_HEADERS.iter().map(|h| h.to_string()).collect(),
            header_canon: Canonicalization::Relaxed,
            body_canon: Canonicalization::Relaxed,
            expire_after: None,
        }
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.headers = headers
            .into_iter()
            .map(|h| h.into().to_lowercase())
            .collect();
        self
    }

    pub fn with_canonicalization(
        mut self,
        header: Canonicalization,
        body: Canonicalization,
    ) -> Self {
        self.header_canon = header;
        self.body_canon = body;
        self
    }

    pub fn with_expiration(mut self, expire_after_secs: u64) -> Self {
        self.expire_after = Some(expire_after_secs);
        self
    }

    pub fn algorithm(&self) -> Algorithm {
        match &self.key {
            SigningKey::RsaSha256(_) => Algorithm::RsaSha256,
            SigningKey::Ed25519(_) => Algorithm::Ed25519Sha256,
        }
    }

    /// Signs `message` (a complete header block plus body) and returns the
    /// `DKIM-Signature` header to prepend, terminated with CRLF.
    pub fn sign(&self, message: &[u8]) -> Result<String, DkimError> {
        self.sign_at(
            message,
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        )
    }

    /// Signs the concatenation of `parts`; used when headers are still being
    /// assembled separately from the received body.
    pub fn sign_chained(&self, parts: &[&[u8]], timestamp: u64) -> Result<String, DkimError> {
        let mut message = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            message.extend_from_slice(part);
        }
        self.sign_at(&message, timestamp)
    }

    pub fn sign_at(&self, message: &[u8], timestamp: u64) -> Result<String, DkimError> {
        let message = ParsedMessage::parse(message)
            .ok_or_else(|| DkimError("Message has no headers".to_string()))?;

        let body_hash = STANDARD.encode(Sha256::digest(self.body_canon.body(message.body, None)));

        // Select signed header occurrences bottom-up.
        let mut used = vec![false; message.headers.len()];
        let mut selected = Vec::new();
        let mut signed_names = Vec::new();
        for name in &self.headers {
            for idx in (0..message.headers.len()).rev() {
                if !used[idx]
                    && message.headers[idx]
                        .name
                        .eq_ignore_ascii_case(name.as_bytes())
                {
                    used[idx] = true;
                    selected.push(idx);
                    signed_names.push(name.as_str());
                }
            }
        }
        if signed_names.is_empty() || !signed_names.iter().any(|n| *n == "from") {
            return Err(DkimError("Message has no From header to sign".to_string()));
        }

        // Assemble the unsigned header value, b= last.
        let mut value = String::with_capacity(256);
        let _ = write!(
            value,
            "v=1; a={}; d={}; s={};",
            self.algorithm(),
            self.domain,
            self.selector
        );
        let _ = write!(
            value,
            "\r\n\tc={}/{}; t={timestamp};",
            self.header_canon, self.body_canon
        );
        if let Some(expire_after) = self.expire_after {
            let _ = write!(value, " x={};", timestamp + expire_after);
        }
        value.push_str("\r\n\th=");
        for (pos, name) in signed_names.iter().enumerate() {
            if pos > 0 {
                value.push(':');
            }
            value.push_str(name);
        }
        let _ = write!(value, ";\r\n\tbh={body_hash};\r\n\tb=");

        // Hash the canonical headers followed by this header, unsigned.
        let mut data = Vec::with_capacity(1024);
        for idx in selected {
            let header = &message.headers[idx];
            self.header_canon.header(header.name, header.value, &mut data);
        }
        self.header_canon
            .header(b"DKIM-Signature", format!(" {value}").as_bytes(), &mut data);
        data.truncate(data.len() - 2);

        let digest = Sha256::digest(&data);
        let signature = match &self.key {
            SigningKey::RsaSha256(key) => key
                .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                .map_err(|err| DkimError(format!("RSA signing failed: {err}")))?,
            SigningKey::Ed25519(key) => key.sign(&digest).to_bytes().to_vec(),
        };

        let mut header = String::with_capacity(value.len() + signature.len() * 2);
        header.push_str("DKIM-Signature: ");
        header.push_str(&value);
        for (pos, chunk) in STANDARD.encode(signature).into_bytes().chunks(66).enumerate() {
            if pos > 0 {
                header.push_str("\r\n\t ");
            }
            header.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        }
        header.push_str("\r\n");
        Ok(header)
    }

    /// The public key record to publish for this signer, useful for
    /// provisioning and tests.
    pub fn key_record(&self) -> String {
        match &self.key {
            SigningKey::RsaSha256(key) => {
                use rsa::pkcs8::EncodePublicKey;
                let der = key
                    .to_public_key()
                    .to_public_key_der()
                    .map(|der| der.as_bytes().to_vec())
                    .unwrap_or_default();
                format!("v=DKIM1; k=rsa; p={}", STANDARD.encode(der))
            }
            SigningKey::Ed25519(key) => format!(
                "v=DKIM1; k=ed25519; p={}",
                STANDARD.encode(key.verifying_key().to_bytes())
            ),
        }
    }
}
