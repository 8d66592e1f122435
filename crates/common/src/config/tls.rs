/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{io::Cursor, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::ring::default_provider,
    ClientConfig, RootCertStore, ServerConfig, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Server-side TLS material plus the certificate digest used for the
/// `tls-server-end-point` channel binding of the SCRAM `-PLUS` mechanisms.
pub struct ServerTls {
    pub acceptor: TlsAcceptor,
    pub cert_fingerprint: Vec<u8>,
}

pub fn build_server_tls(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerTls, String> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(cert_pem))
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|err| format!("Failed to read certificates: {err}"))?;
    let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem))
        .map_err(|err| format!("Failed to read private key: {err}"))?
        .ok_or_else(|| "No private key found".to_string())?;
    build_server_tls_der(certs, key)
}

pub fn build_server_tls_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerTls, String> {
    let cert_fingerprint = certs
        .first()
        .map(|cert| Sha256::digest(cert.as_ref()).to_vec())
        .ok_or_else(|| "No certificates found".to_string())?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| format!("Failed to build TLS configuration: {err}"))?;

    Ok(ServerTls {
        acceptor: TlsAcceptor::from(Arc::new(config)),
        cert_fingerprint,
    })
}

/// Outbound connectors: one verifying against the webpki roots, one that
/// accepts any certificate. DANE and opportunistic deliveries use the latter,
/// certificate identity is then checked against TLSA records instead.
pub struct TlsConnectors {
    pub pki_verify: TlsConnector,
    pub dummy_verify: TlsConnector,
}

impl TlsConnectors {
    pub fn build() -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let pki_verify = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let mut dummy_verify = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DummyVerifier))
            .with_no_client_auth();
        dummy_verify.enable_sni = false;

        TlsConnectors {
            pki_verify: TlsConnector::from(Arc::new(pki_verify)),
            dummy_verify: TlsConnector::from(Arc::new(dummy_verify)),
        }
    }
}

impl Default for TlsConnectors {
    fn default() -> Self {
        Self::build()
    }
}

#[derive(Debug)]
struct DummyVerifier;

impl ServerCertVerifier for DummyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
