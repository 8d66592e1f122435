/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use rsa::Pkcs1v15Sign;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{message::ParsedMessage, DnsError, Lookup};

use super::{
    Algorithm, DkimOutput, DkimResult, DomainKey, PublicKey, Signature, MAX_SIGNATURES,
};

/// Verifies every `DKIM-Signature` header of `message`. Returns one output
/// per evaluated signature, in header order; an unsigned message yields an
/// empty list.
pub async fn verify_dkim(
    resolver: &impl Lookup,
    message: &ParsedMessage<'_>,
    now: u64,
) -> Vec<DkimOutput> {
    let mut outputs = Vec::new();

    for (header_idx, header) in message.headers.iter().enumerate() {
        if !header.name.eq_ignore_ascii_case(b"DKIM-Signature") {
            continue;
        }
        if outputs.len() >= MAX_SIGNATURES {
            break;
        }

        let signature = match Signature::parse(header.value) {
            Ok(signature) => signature,
            Err(err) => {
                outputs.push(DkimOutput {
                    result: DkimResult::Neutral(format!("signature parse error: {err}")),
                    signature: None,
                });
                continue;
            }
        };

        let result = verify_signature(resolver, message, header_idx, &signature, now).await;
        outputs.push(DkimOutput {
            result,
            signature: Some(signature),
        });
    }

    outputs
}

async fn verify_signature(
    resolver: &impl Lookup,
    message: &ParsedMessage<'_>,
    signature_idx: usize,
    signature: &Signature,
    now: u64,
) -> DkimResult {
    // Timestamps, with a little clock-skew allowance.
    if signature.expiration != 0 && signature.expiration + 300 < now {
        return DkimResult::Fail("signature expired".to_string());
    }
    if signature.timestamp != 0 && signature.timestamp > now + 300 {
        return DkimResult::Fail("signature timestamp in the future".to_string());
    }

    // Body hash must match before any key fetch.
    let body = signature
        .body_canon
        .body(message.body, signature.body_length);
    let body_hash: Vec<u8> = match signature.algorithm {
        Algorithm::RsaSha256 | Algorithm::Ed25519Sha256 => Sha256::digest(&body).to_vec(),
        Algorithm::RsaSha1 => Sha1::digest(&body).to_vec(),
    };
    if body_hash != signature.body_hash {
        return DkimResult::Fail("body hash mismatch".to_string());
    }

    // Fetch and parse the public key record.
    let key_name = format!("{}._domainkey.{}", signature.selector, signature.domain);
    let key = match resolver.txt(&key_name).await {
        Ok(records) => match DomainKey::from_txt(&records) {
            Ok(key) => key,
            Err(err) => return DkimResult::PermError(format!("key record: {err}")),
        },
        Err(DnsError::NotFound) => {
            return DkimResult::Fail("no key record found".to_string());
        }
        Err(DnsError::Temporary(err)) => {
            return DkimResult::TempError(format!("key lookup: {err}"));
        }
        Err(DnsError::Permanent(err)) => {
            return DkimResult::PermError(format!("key lookup: {err}"));
        }
    };

    let hash_name = match signature.algorithm {
        Algorithm::RsaSha256 | Algorithm::Ed25519Sha256 => "sha256",
        Algorithm::RsaSha1 => "sha1",
    };
    if !key.hashes.is_empty() && !key.hashes.iter().any(|h| h == hash_name) {
        return DkimResult::Fail(format!("hash {hash_name} not acceptable to key"));
    }
    if key.strict {
        if let Some(identity) = &signature.identity {
            let identity_domain = identity
                .rsplit_once('@')
                .map(|(_, d)| d)
                .unwrap_or(identity)
                .to_lowercase();
            if identity_domain != signature.domain {
                return DkimResult::Fail("i= not allowed by strict key".to_string());
            }
        }
    }

    // Reassemble the signed data: the listed headers bottom-up, then this
    // signature header with the b= value removed.
    let mut used = vec![false; message.headers.len()];
    let mut data = Vec::with_capacity(1024);
    for name in &signature.headers {
        for idx in (0..message.headers.len()).rev() {
            if !used[idx]
                && message.headers[idx]
                    .name
                    .eq_ignore_ascii_case(name.as_bytes())
            {
                used[idx] = true;
                let header = &message.headers[idx];
                signature
                    .header_canon
                    .header(header.name, header.value, &mut data);
                break;
            }
        }
    }
    let sig_header = &message.headers[signature_idx];
    signature.header_canon.header(
        sig_header.name,
        &strip_signature_value(sig_header.value),
        &mut data,
    );
    data.truncate(data.len() - 2);

    match &key.public_key {
        PublicKey::Revoked => DkimResult::Fail("key revoked".to_string()),
        PublicKey::Rsa(public_key) => {
            let verified = match signature.algorithm {
                Algorithm::RsaSha256 => public_key
                    .verify(
                        Pkcs1v15Sign::new::<Sha256>(),
                        &Sha256::digest(&data),
                        &signature.signature,
                    )
                    .is_ok(),
                Algorithm::RsaSha1 => public_key
                    .verify(
                        Pkcs1v15Sign::new::<Sha1>(),
                        &Sha1::digest(&data),
                        &signature.signature,
                    )
                    .is_ok(),
                Algorithm::Ed25519Sha256 => {
                    return DkimResult::PermError("algorithm does not match key type".to_string())
                }
            };
            if verified {
                DkimResult::Pass
            } else {
                DkimResult::Fail("signature verification failed".to_string())
            }
        }
        PublicKey::Ed25519(public_key) => {
            if signature.algorithm != Algorithm::Ed25519Sha256 {
                return DkimResult::PermError("algorithm does not match key type".to_string());
            }
            let Ok(sig_bytes) = signature.signature.as_slice().try_into() else {
                return DkimResult::Fail("invalid signature length".to_string());
            };
            if public_key
                .verify_strict(
                    &Sha256::digest(&data),
                    &ed25519_dalek::Signature::from_bytes(&sig_bytes),
                )
                .is_ok()
            {
                DkimResult::Pass
            } else {
                DkimResult::Fail("signature verification failed".to_string())
            }
        }
    }
}

/// Removes the value of the `b=` tag, leaving the tag itself in place.
fn strip_signature_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    let mut at_tag_start = true;
    let mut pos = 0;
    while pos < value.len() {
        let byte = value[pos];
        if at_tag_start
            && (byte == b'b' || byte == b'B')
            && value
                .get(pos + 1..)
                .map_or(false, |rest| {
                    let rest = rest
                        .iter()
                        .position(|b| !b.is_ascii_whitespace())
                        .map_or(&b""[..], |skip| &rest[skip..]);
                    rest.first() == Some(&b'=')
                })
        {
            // Copy up to and including '=', then skip to the next ';'.
            out.push(byte);
            pos += 1;
            while pos < value.len() {
                let byte = value[pos];
                out.push(byte);
                pos += 1;
                if byte == b'=' {
                    break;
                }
            }
            while pos < value.len() && value[pos] != b';' {
                pos += 1;
            }
            continue;
        }
        match byte {
            b';' => at_tag_start = true,
            b' ' | b'\t' | b'\r' | b'\n' => (),
            _ => at_tag_start = false,
        }
        out.push(byte);
        pos += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::{
        dkim::{Canonicalization, DkimSigner},
        test_support::TestLookup,
    };

    const NOW: u64 = 1700000000;

    fn test_message() -> Vec<u8> {
        b"To: bob@b.example\r\nFrom: alice@a.example\r\nSubject: hi\r\n\r\nok\r\n".to_vec()
    }

    fn ed_signer() -> DkimSigner {
        let key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        DkimSigner::from_ed25519_key(key, "a.example", "ed1")
    }

    async fn sign_and_verify(signer: &DkimSigner, tamper: Option<&[u8]>) -> DkimResult {
        let message = test_message();
        let header = signer.sign_at(&message, NOW).unwrap();
        let mut signed = header.into_bytes();
        signed.extend_from_slice(tamper.unwrap_or(&message));

        let resolver = TestLookup::new().txt_owned(
            &format!("{}._domainkey.a.example", signer.selector),
            &[signer.key_record()],
        );
        let parsed = ParsedMessage::parse(&signed).unwrap();
        let outputs = verify_dkim(&resolver, &parsed, NOW + 60).await;
        assert_eq!(outputs.len(), 1);
        outputs.into_iter().next().unwrap().result
    }

    #[tokio::test]
    async fn ed25519_round_trip() {
        assert_eq!(sign_and_verify(&ed_signer(), None).await, DkimResult::Pass);
    }

    #[tokio::test]
    async fn rsa_round_trip_all_canonicalizations() {
        let key = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        for (header, body) in [
            (Canonicalization::Relaxed, Canonicalization::Relaxed),
            (Canonicalization::Relaxed, Canonicalization::Simple),
            (Canonicalization::Simple, Canonicalization::Relaxed),
            (Canonicalization::Simple, Canonicalization::Simple),
        ] {
            let signer = DkimSigner::from_rsa_key(key.clone(), "a.example", "rsa1")
                .with_canonicalization(header, body);
            assert_eq!(
                sign_and_verify(&signer, None).await,
                DkimResult::Pass,
                "{header}/{body}"
            );
        }
    }

    #[tokio::test]
    async fn tampered_body_fails() {
        let result =
            sign_and_verify(&ed_signer(), Some(b"To: bob@b.example\r\nFrom: alice@a.example\r\nSubject: hi\r\n\r\ntampered\r\n"))
                .await;
        assert_eq!(result, DkimResult::Fail("body hash mismatch".to_string()));
    }

    #[tokio::test]
    async fn tampered_header_fails() {
        let result = sign_and_verify(
            &ed_signer(),
            Some(b"To: bob@b.example\r\nFrom: alice@a.example\r\nSubject: hello\r\n\r\nok\r\n"),
        )
        .await;
        assert_eq!(
            result,
            DkimResult::Fail("signature verification failed".to_string())
        );
    }

    #[tokio::test]
    async fn expired_signature_fails() {
        let signer = ed_signer().with_expiration(3600);
        let message = test_message();
        let header = signer.sign_at(&message, NOW - 7200).unwrap();
        let mut signed = header.into_bytes();
        signed.extend_from_slice(&message);

        let resolver = TestLookup::new()
            .txt_owned("ed1._domainkey.a.example", &[signer.key_record()]);
        let parsed = ParsedMessage::parse(&signed).unwrap();
        let outputs = verify_dkim(&resolver, &parsed, NOW).await;
        assert_eq!(
            outputs[0].result,
            DkimResult::Fail("signature expired".to_string())
        );
    }

    #[tokio::test]
    async fn missing_key_record_fails() {
        let signer = ed_signer();
        let message = test_message();
        let header = signer.sign_at(&message, NOW).unwrap();
        let mut signed = header.into_bytes();
        signed.extend_from_slice(&message);

        let parsed = ParsedMessage::parse(&signed).unwrap();
        let outputs = verify_dkim(&TestLookup::new(), &parsed, NOW).await;
        assert_eq!(
            outputs[0].result,
            DkimResult::Fail("no key record found".to_string())
        );
    }

    #[test]
    fn strips_b_value_only() {
        let stripped = strip_signature_value(b"v=1; a=rsa-sha256; bh=abc; b=def\r\n\tghi; t=1");
        assert_eq!(stripped, b"v=1; a=rsa-sha256; bh=abc; b=; t=1".to_vec());
    }
}
