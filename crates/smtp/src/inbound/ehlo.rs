/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use auth::spf::verify_spf_helo;
use common::{config::ServerProtocol, listener::SessionStream};
use smtp_proto::*;

use crate::core::Session;

impl<T: SessionStream> Session<T> {
    pub async fn handle_ehlo(&mut self, domain: String, is_esmtp: bool) -> Result<(), ()> {
        if domain != self.data.helo_domain {
            // Reject non-FQDN EHLO hostnames, a single label is never routable.
            if self.params.ehlo_reject_non_fqdn && !auth::has_labels(&domain) {
                tracing::info!(parent: &self.span,
                    context = "ehlo",
                    event = "reject",
                    reason = "invalid",
                    domain = domain,
                );
                return self.write(b"550 5.5.0 Invalid EHLO domain.\r\n").await;
            }

            let prev_helo_domain = std::mem::replace(&mut self.data.helo_domain, domain);
            if self.params.spf_ehlo.verify() {
                let spf_output = verify_spf_helo(
                    &self.core.core.resolver,
                    self.data.remote_ip,
                    &self.data.helo_domain,
                    &self.instance.hostname,
                )
                .await;

                tracing::debug!(parent: &self.span,
                    context = "spf",
                    event = "lookup",
                    identity = "ehlo",
                    domain = self.data.helo_domain,
                    result = %spf_output.result(),
                );

                if self
                    .handle_spf(&spf_output, self.params.spf_ehlo.is_strict())
                    .await?
                {
                    self.data.spf_ehlo = spf_output.into();
                } else {
                    self.data.mail_from = None;
                    self.data.helo_domain = prev_helo_domain;
                    return Ok(());
                }
            }
        }

        // Reset the envelope on repeated EHLO.
        if self.data.mail_from.is_some() {
            self.reset();
        }

        if !is_esmtp {
            return self
                .write(format!("250 {} Hello\r\n", self.instance.hostname).as_bytes())
                .await;
        }

        let mut response = EhloResponse::new(self.instance.hostname.as_str());
        response.capabilities = EXT_ENHANCED_STATUS_CODES
            | EXT_8BIT_MIME
            | EXT_SMTP_UTF8
            | EXT_PIPELINING
            | EXT_DSN
            | EXT_REQUIRE_TLS;
        if !self.stream.is_tls() && self.instance.tls_acceptor.is_some() {
            response.capabilities |= EXT_START_TLS;
        }
        response.size = self.params.max_message_size;
        if response.size > 0 {
            response.capabilities |= EXT_SIZE;
        }
        if self.data.authenticated_as.is_empty() {
            response.auth_mechanisms = self.allowed_mechanisms();
            if response.auth_mechanisms != 0 {
                response.capabilities |= EXT_AUTH;
            }
        }

        let mut buf = Vec::with_capacity(128);
        response.write(&mut buf).ok();
        self.write(&buf).await
    }

    /// SASL mechanisms available right now: submission listeners only,
    /// plaintext-password mechanisms only over TLS, channel-binding
    /// variants only when the transport can provide a binding.
    pub fn allowed_mechanisms(&self) -> u64 {
        if self.instance.protocol != ServerProtocol::Submission {
            return 0;
        }
        let mut mechanisms = AUTH_CRAM_MD5 | AUTH_SCRAM_SHA_1 | AUTH_SCRAM_SHA_256;
        if self.stream.is_tls() {
            mechanisms |= AUTH_PLAIN | AUTH_LOGIN;
            if !self.instance.cert_fingerprint.is_empty() {
                mechanisms |= AUTH_SCRAM_SHA_1_PLUS | AUTH_SCRAM_SHA_256_PLUS;
            }
        }
        mechanisms
    }
}
