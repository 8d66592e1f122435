/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use auth::dane::Tlsa;
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256, Sha512};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::queue::{Error, ErrorDetails, Status};

pub trait TlsaVerify {
    fn verify(
        &self,
        span: &tracing::Span,
        hostname: &str,
        certificates: Option<&[CertificateDer<'_>]>,
    ) -> Result<(), Status<(), Error>>;
}

impl TlsaVerify for Tlsa {
    /// RFC 7672 verification of the presented chain: DANE-EE matches the
    /// end-entity certificate regardless of PKIX validity or hostname,
    /// DANE-TA matches any intermediate.
    fn verify(
        &self,
        span: &tracing::Span,
        hostname: &str,
        certificates: Option<&[CertificateDer<'_>]>,
    ) -> Result<(), Status<(), Error>> {
        let certificates = if let Some(certificates) = certificates.filter(|c| !c.is_empty()) {
            certificates
        } else {
            tracing::debug!(parent: span,
                context = "dane",
                event = "no-certificates",
                mx = hostname);
            return Err(Status::TemporaryFailure(Error::DaneError(ErrorDetails {
                entity: hostname.to_string(),
                details: "No certificates were provided by host".to_string(),
            })));
        };

        let mut matched_end_entity = false;
        let mut matched_intermediate = false;
        'outer: for (pos, der_certificate) in certificates.iter().enumerate() {
            let certificate = match X509Certificate::from_der(der_certificate.as_ref()) {
                Ok((_, certificate)) => certificate,
                Err(err) => {
                    tracing::debug!(parent: span,
                        context = "dane",
                        event = "cert-parse-error",
                        mx = hostname,
                        reason = %err);
                    return Err(Status::TemporaryFailure(Error::DaneError(ErrorDetails {
                        entity: hostname.to_string(),
                        details: "Failed to parse X.509 certificate".to_string(),
                    })));
                }
            };

            let is_end_entity = pos == 0;
            let mut sha256: [Option<Vec<u8>>; 2] = [None, None];
            let mut sha512: [Option<Vec<u8>>; 2] = [None, None];
            for record in self.entries.iter() {
                if record.is_end_entity != is_end_entity {
                    continue;
                }
                let data: &[u8] = if record.is_spki {
                    certificate.public_key().raw
                } else {
                    der_certificate.as_ref()
                };
                let hash: &[u8] = if record.is_sha256 {
                    sha256[usize::from(record.is_spki)]
                        .get_or_insert_with(|| Sha256::digest(data).to_vec())
                } else {
                    sha512[usize::from(record.is_spki)]
                        .get_or_insert_with(|| Sha512::digest(data).to_vec())
                };

                if hash == record.data.as_slice() {
                    tracing::debug!(parent: span,
                        context = "dane",
                        event = "tlsa-match",
                        mx = hostname,
                        certificate = if is_end_entity { "end-entity" } else { "intermediate" });
                    if is_end_entity {
                        matched_end_entity = true;
                        if !self.has_intermediates {
                            break 'outer;
                        }
                    } else {
                        matched_intermediate = true;
                        break 'outer;
                    }
                }
            }
        }

        if (self.has_end_entities && matched_end_entity)
            || ((self.has_end_entities == matched_end_entity)
                && (self.has_intermediates == matched_intermediate))
        {
            tracing::debug!(parent: span,
                context = "dane",
                event = "authenticated",
                mx = hostname);
            Ok(())
        } else {
            tracing::info!(parent: span,
                context = "dane",
                event = "auth-failed",
                mx = hostname);
            Err(Status::PermanentFailure(Error::DaneError(ErrorDetails {
                entity: hostname.to_string(),
                details: "No matching certificates found in TLSA records".to_string(),
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use auth::dane::TlsaEntry;

    use super::*;

    fn tlsa(entries: Vec<TlsaEntry>) -> Tlsa {
        let has_end_entities = entries.iter().any(|e| e.is_end_entity);
        let has_intermediates = entries.iter().any(|e| !e.is_end_entity);
        Tlsa {
            entries,
            has_end_entities,
            has_intermediates,
        }
    }

    fn entry(is_spki: bool, data: Vec<u8>) -> TlsaEntry {
        TlsaEntry {
            is_end_entity: true,
            is_sha256: true,
            is_spki,
            data,
        }
    }

    #[test]
    fn dane_ee_matches_self_signed_certificate() {
        // A 3 1 1 record pins the SPKI hash; PKIX validity and hostname
        // never enter into it.
        let certified = rcgen::generate_simple_self_signed(vec!["mx.f.example".to_string()])
            .unwrap();
        let der = certified.cert.der().to_vec();
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        let spki_hash = Sha256::digest(parsed.public_key().raw).to_vec();

        let span = tracing::info_span!("test");
        let certs = [CertificateDer::from(der.clone())];

        let policy = tlsa(vec![entry(true, spki_hash)]);
        assert!(policy.verify(&span, "some-other-name.example", Some(&certs)).is_ok());

        // A full-certificate (3 0 1) pin matches the DER hash.
        let policy = tlsa(vec![entry(false, Sha256::digest(&der).to_vec())]);
        assert!(policy.verify(&span, "mx.f.example", Some(&certs)).is_ok());

        // A mismatched pin is a permanent failure.
        let policy = tlsa(vec![entry(true, vec![0u8; 32])]);
        assert!(matches!(
            policy.verify(&span, "mx.f.example", Some(&certs)),
            Err(Status::PermanentFailure(Error::DaneError(_)))
        ));
    }

    #[test]
    fn missing_certificates_is_temporary() {
        let policy = tlsa(vec![entry(false, vec![1u8; 32])]);
        let span = tracing::info_span!("test");
        assert!(matches!(
            policy.verify(&span, "mx.f.example", None),
            Err(Status::TemporaryFailure(Error::DaneError(_)))
        ));
    }

    #[test]
    fn unparseable_certificate_is_temporary() {
        let policy = tlsa(vec![entry(false, vec![1u8; 32])]);
        let span = tracing::info_span!("test");
        let certs = [CertificateDer::from(b"not-a-cert".to_vec())];
        assert!(matches!(
            policy.verify(&span, "mx.f.example", Some(&certs)),
            Err(Status::TemporaryFailure(Error::DaneError(_)))
        ));
    }
}
