/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::SessionStream;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::{distributions::Alphanumeric, Rng};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use smtp_proto::{
    AUTH_CRAM_MD5, AUTH_LOGIN, AUTH_PLAIN, AUTH_SCRAM_SHA_1, AUTH_SCRAM_SHA_1_PLUS,
    AUTH_SCRAM_SHA_256, AUTH_SCRAM_SHA_256_PLUS,
};

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::core::Session;

const SCRAM_ITERATIONS: u32 = 4096;

pub enum SaslToken {
    Plain,
    Login {
        username: Option<String>,
    },
    CramMd5 {
        challenge: String,
    },
    Scram {
        sha1: bool,
        plus: bool,
        phase: ScramPhase,
    },
}

pub enum ScramPhase {
    Init,
    Verify {
        username: String,
        client_first_bare: String,
        server_first: String,
        gs2_header: String,
        salt: Vec<u8>,
    },
    /// Server-final was sent, waiting for the client's empty line.
    Done {
        username: String,
    },
}

impl SaslToken {
    pub fn from_mechanism(mechanism: u64) -> Option<SaslToken> {
        match mechanism {
            AUTH_PLAIN => Some(SaslToken::Plain),
            AUTH_LOGIN => Some(SaslToken::Login { username: None }),
            AUTH_CRAM_MD5 => Some(SaslToken::CramMd5 {
                challenge: String::new(),
            }),
            AUTH_SCRAM_SHA_1 | AUTH_SCRAM_SHA_1_PLUS | AUTH_SCRAM_SHA_256
            | AUTH_SCRAM_SHA_256_PLUS => Some(SaslToken::Scram {
                sha1: matches!(mechanism, AUTH_SCRAM_SHA_1 | AUTH_SCRAM_SHA_1_PLUS),
                plus: matches!(mechanism, AUTH_SCRAM_SHA_1_PLUS | AUTH_SCRAM_SHA_256_PLUS),
                phase: ScramPhase::Init,
            }),
            _ => None,
        }
    }
}

impl<T: SessionStream> Session<T> {
    /// Advances the SASL exchange with one client line. `Ok(true)` keeps the
    /// session in line mode for another round.
    pub async fn handle_sasl_response(
        &mut self,
        token: &mut SaslToken,
        response: &[u8],
    ) -> Result<bool, ()> {
        match token {
            SaslToken::Plain => {
                if response.is_empty() {
                    self.write(b"334 \r\n").await?;
                    return Ok(true);
                }
                let Ok(decoded) = STANDARD.decode(response) else {
                    return self.bad_base64().await;
                };
                let mut parts = decoded.split(|&b| b == 0);
                let (_authzid, authcid, password) =
                    (parts.next(), parts.next(), parts.next());
                match (authcid, password) {
                    (Some(authcid), Some(password)) if !authcid.is_empty() => {
                        let username = String::from_utf8_lossy(authcid).into_owned();
                        let password = String::from_utf8_lossy(password).into_owned();
                        self.verify_password(&username, &password).await?;
                    }
                    _ => {
                        self.auth_error(b"500 5.5.6 Invalid PLAIN response.\r\n")
                            .await?;
                    }
                }
                Ok(false)
            }
            SaslToken::Login { username } => {
                if response.is_empty() && username.is_none() {
                    self.write(b"334 VXNlcm5hbWU6\r\n").await?;
                    return Ok(true);
                }
                let Ok(decoded) = STANDARD.decode(response) else {
                    return self.bad_base64().await;
                };
                let decoded = String::from_utf8_lossy(&decoded).into_owned();
                match username.take() {
                    None => {
                        *username = Some(decoded);
                        self.write(b"334 UGFzc3dvcmQ6\r\n").await?;
                        Ok(true)
                    }
                    Some(username) => {
                        self.verify_password(&username, &decoded).await?;
                        Ok(false)
                    }
                }
            }
            SaslToken::CramMd5 { challenge } => {
                if response.is_empty() {
                    *challenge = format!(
                        "<{}.{}@{}>",
                        rand::thread_rng()
                            .sample_iter(Alphanumeric)
                            .take(12)
                            .map(char::from)
                            .collect::<String>(),
                        std::process::id(),
                        self.instance.hostname
                    );
                    self.write(format!("334 {}\r\n", STANDARD.encode(challenge.as_bytes())).as_bytes())
                        .await?;
                    return Ok(true);
                }
                let Ok(decoded) = STANDARD.decode(response) else {
                    return self.bad_base64().await;
                };
                let decoded = String::from_utf8_lossy(&decoded).into_owned();
                let Some((username, digest)) = decoded.rsplit_once(' ') else {
                    self.auth_error(b"500 5.5.6 Invalid CRAM-MD5 response.\r\n")
                        .await?;
                    return Ok(false);
                };
                let authenticated = self
                    .core
                    .core
                    .accounts
                    .secret(username)
                    .map_or(false, |secret| {
                        let mut mac = Hmac::<Md5>::new_from_slice(secret.as_bytes())
                            .expect("HMAC accepts any key length");
                        mac.update(challenge.as_bytes());
                        let expected = mac
                            .finalize()
                            .into_bytes()
                            .iter()
                            .map(|b| format!("{b:02x}"))
                            .collect::<String>();
                        expected == digest
                    });
                self.finish_authentication(username.to_string(), authenticated)
                    .await?;
                Ok(false)
            }
            SaslToken::Scram { sha1, plus, phase } => {
                self.handle_scram(*sha1, *plus, phase, response).await
            }
        }
    }

    async fn handle_scram(
        &mut self,
        sha1: bool,
        plus: bool,
        phase: &mut ScramPhase,
        response: &[u8],
    ) -> Result<bool, ()> {
        // Take ownership of the phase; every arm leaves the next state
        // behind before returning.
        match std::mem::replace(phase, ScramPhase::Init) {
            ScramPhase::Init => {
                if response.is_empty() {
                    self.write(b"334 \r\n").await?;
                    return Ok(true);
                }
                let Ok(decoded) = STANDARD.decode(response) else {
                    return self.bad_base64().await;
                };
                let decoded = String::from_utf8_lossy(&decoded).into_owned();

                // GS2 header: "n,," / "y,," or "p=<cb-name>,," for -PLUS.
                let Some((gs2_header, client_first_bare)) = split_gs2(&decoded) else {
                    self.auth_error(b"500 5.5.6 Invalid SCRAM client-first message.\r\n")
                        .await?;
                    return Ok(false);
                };
                if plus != gs2_header.starts_with("p=") {
                    self.auth_error(b"500 5.5.6 Channel binding mismatch.\r\n")
                        .await?;
                    return Ok(false);
                }
                if plus && !gs2_header.starts_with("p=tls-server-end-point") {
                    self.auth_error(b"500 5.5.6 Unsupported channel binding type.\r\n")
                        .await?;
                    return Ok(false);
                }

                let mut username = None;
                let mut client_nonce = None;
                for attr in client_first_bare.split(',') {
                    match attr.split_once('=') {
                        Some(("n", value)) => username = Some(value.replace("=2C", ",").replace("=3D", "=")),
                        Some(("r", value)) => client_nonce = Some(value.to_string()),
                        _ => (),
                    }
                }
                let (Some(username), Some(client_nonce)) = (username, client_nonce) else {
                    self.auth_error(b"500 5.5.6 Invalid SCRAM client-first message.\r\n")
                        .await?;
                    return Ok(false);
                };

                let server_nonce: String = rand::thread_rng()
                    .sample_iter(Alphanumeric)
                    .take(24)
                    .map(char::from)
                    .collect();
                let salt: Vec<u8> = rand::thread_rng()
                    .sample_iter(rand::distributions::Standard)
                    .take(16)
                    .collect();
                let server_first = format!(
                    "r={client_nonce}{server_nonce},s={},i={SCRAM_ITERATIONS}",
                    STANDARD.encode(&salt)
                );
                self.write(format!("334 {}\r\n", STANDARD.encode(server_first.as_bytes())).as_bytes())
                    .await?;
                *phase = ScramPhase::Verify {
                    username,
                    client_first_bare: client_first_bare.to_string(),
                    server_first,
                    gs2_header: gs2_header.to_string(),
                    salt,
                };
                Ok(true)
            }
            ScramPhase::Verify {
                username,
                client_first_bare,
                server_first,
                gs2_header,
                salt,
            } => {
                let Ok(decoded) = STANDARD.decode(response) else {
                    return self.bad_base64().await;
                };
                let decoded = String::from_utf8_lossy(&decoded).into_owned();

                let mut channel_binding = None;
                let mut nonce = None;
                let mut proof = None;
                let mut without_proof_len = decoded.len();
                for attr in decoded.split(',') {
                    match attr.split_once('=') {
                        Some(("c", value)) => channel_binding = Some(value.to_string()),
                        Some(("r", value)) => nonce = Some(value.to_string()),
                        Some(("p", value)) => {
                            proof = STANDARD.decode(value).ok();
                            without_proof_len = decoded.len() - attr.len() - 1;
                        }
                        _ => (),
                    }
                }
                let (Some(channel_binding), Some(_nonce), Some(proof)) =
                    (channel_binding, nonce, proof)
                else {
                    self.auth_error(b"500 5.5.6 Invalid SCRAM client-final message.\r\n")
                        .await?;
                    return Ok(false);
                };

                // c= carries the GS2 header plus, for -PLUS, the binding data.
                let mut expected_cbind = gs2_header.as_bytes().to_vec();
                expected_cbind.extend_from_slice(b",,");
                if plus {
                    expected_cbind.extend_from_slice(&self.instance.cert_fingerprint);
                }
                if STANDARD.encode(&expected_cbind) != channel_binding {
                    self.auth_error(b"535 5.7.8 Channel binding verification failed.\r\n")
                        .await?;
                    return Ok(false);
                }

                let auth_message = format!(
                    "{client_first_bare},{server_first},{}",
                    &decoded[..without_proof_len]
                );
                let verified = self.core.core.accounts.secret(&username).and_then(|secret| {
                    if sha1 {
                        scram_verify_sha1(&secret, &salt, &auth_message, &proof)
                    } else {
                        scram_verify_sha256(&secret, &salt, &auth_message, &proof)
                    }
                });

                match verified {
                    Some(server_signature) => {
                        self.write(
                            format!(
                                "334 {}\r\n",
                                STANDARD.encode(format!(
                                    "v={}",
                                    STANDARD.encode(server_signature)
                                ))
                            )
                            .as_bytes(),
                        )
                        .await?;
                        *phase = ScramPhase::Done { username };
                        Ok(true)
                    }
                    None => {
                        self.finish_authentication(username, false).await?;
                        Ok(false)
                    }
                }
            }
            ScramPhase::Done { username } => {
                self.finish_authentication(username, true).await?;
                Ok(false)
            }
        }
    }

    async fn verify_password(&mut self, username: &str, password: &str) -> Result<(), ()> {
        let authenticated = self
            .core
            .core
            .accounts
            .secret(username)
            .map_or(false, |secret| secret == password);
        self.finish_authentication(username.to_string(), authenticated)
            .await
    }

    async fn finish_authentication(
        &mut self,
        username: String,
        authenticated: bool,
    ) -> Result<(), ()> {
        if authenticated {
            tracing::debug!(parent: &self.span,
                context = "auth",
                event = "success",
                login = username.as_str());
            self.data.authenticated_emails = self.core.core.accounts.addresses(&username);
            self.data.authenticated_as = username.to_lowercase();
            self.write(b"235 2.7.0 Authentication succeeded.\r\n").await
        } else {
            tracing::info!(parent: &self.span,
                context = "auth",
                event = "failed",
                login = username.as_str());
            self.auth_error(b"535 5.7.8 Authentication credentials invalid.\r\n")
                .await
        }
    }

    async fn bad_base64(&mut self) -> Result<bool, ()> {
        self.auth_error(b"500 5.5.6 Invalid base64 encoding.\r\n")
            .await?;
        Ok(false)
    }

    /// Failed attempts count against the per-IP window; exhausting it drops
    /// the connection.
    pub async fn auth_error(&mut self, response: &[u8]) -> Result<(), ()> {
        self.data.auth_failures += 1;
        let entry = self.core.ip_limits.entry(
            self.data.remote_ip,
            self.core.core.session.max_connections_per_ip,
            &self.params.auth_rate,
            &self.params.auth_rate,
        );
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        self.write(response).await?;
        if !entry.auth_failures.is_allowed(&self.params.auth_rate)
            || self.data.auth_failures >= self.params.auth_rate.requests as u32
        {
            self.write(b"421 4.7.0 Too many authentication failures, closing connection.\r\n")
                .await?;
            return Err(());
        }
        Ok(())
    }
}

fn split_gs2(message: &str) -> Option<(&str, &str)> {
    // gs2-header = gs2-cbind-flag "," [ authzid ] ","
    let (flag, rest) = message.split_once(',')?;
    let (authzid, bare) = rest.split_once(',')?;
    if authzid.is_empty() || authzid.starts_with("a=") {
        Some((flag, bare))
    } else {
        None
    }
}

/// Verifies a SCRAM client proof and returns the server signature on
/// success, RFC 5802 §3. One instance per supported hash.
macro_rules! scram_verify_impl {
    ($name:ident, $hash:ty, $key_len:literal) => {
        fn $name(
            password: &str,
            salt: &[u8],
            auth_message: &str,
            proof: &[u8],
        ) -> Option<Vec<u8>> {
            fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
                let mut mac = Hmac::<$hash>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }

            if proof.len() != $key_len {
                return None;
            }
            let mut salted_password = [0u8; $key_len];
            pbkdf2::pbkdf2_hmac::<$hash>(
                password.as_bytes(),
                salt,
                SCRAM_ITERATIONS,
                &mut salted_password,
            );

            let client_key = hmac(&salted_password, b"Client Key");
            let stored_key = <$hash>::digest(&client_key);
            let client_signature = hmac(&stored_key, auth_message.as_bytes());

            let recovered_key = proof
                .iter()
                .zip(client_signature.iter())
                .map(|(proof_byte, sig_byte)| proof_byte ^ sig_byte)
                .collect::<Vec<_>>();
            if <$hash>::digest(&recovered_key).as_slice() != stored_key.as_slice() {
                return None;
            }

            let server_key = hmac(&salted_password, b"Server Key");
            Some(hmac(&server_key, auth_message.as_bytes()))
        }
    };
}

scram_verify_impl!(scram_verify_sha1, Sha1, 20);
scram_verify_impl!(scram_verify_sha256, Sha256, 32);
