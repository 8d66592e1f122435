/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use auth::{
    iprev::{verify_iprev, IprevResult},
    spf::{verify_spf, SpfOutput, SpfResult},
};
use common::listener::SessionStream;
use smtp_proto::{MailFrom, MAIL_REQUIRETLS, MAIL_SMTPUTF8};

use crate::core::{Session, SessionAddress};

impl<T: SessionStream> Session<T> {
    pub async fn handle_mail_from(&mut self, from: MailFrom<String>) -> Result<(), ()> {
        if self.data.helo_domain.is_empty()
            && (self.params.ehlo_require
                || self.params.spf_ehlo.verify()
                || self.params.spf_mail_from.verify())
        {
            return self
                .write(b"503 5.5.1 Polite people say EHLO first.\r\n")
                .await;
        } else if self.data.mail_from.is_some() {
            return self
                .write(b"503 5.5.1 Multiple MAIL commands not allowed.\r\n")
                .await;
        } else if self.params.auth_require && self.data.authenticated_as.is_empty() {
            return self
                .write(b"530 5.7.0 Authentication required.\r\n")
                .await;
        }

        // Reverse DNS of the connecting address.
        if self.data.iprev.is_none() && self.params.iprev.verify() {
            let iprev = verify_iprev(&self.core.core.resolver, self.data.remote_ip).await;

            tracing::debug!(parent: &self.span,
                context = "iprev",
                event = "lookup",
                result = %iprev.result,
                ptr = iprev.ptr.first().map(|p| p.as_str()).unwrap_or_default(),
            );

            self.data.iprev = iprev.into();
        }
        if self.params.iprev.is_strict() {
            match self.data.iprev.as_ref().map(|iprev| &iprev.result) {
                Some(IprevResult::Pass) => (),
                Some(IprevResult::TempError(_)) => {
                    return self
                        .write(b"451 4.7.25 Temporary error validating reverse DNS.\r\n")
                        .await;
                }
                _ => {
                    return self
                        .write(b"550 5.7.25 Reverse DNS validation failed.\r\n")
                        .await;
                }
            }
        }

        // DNS block lists.
        if !self.core.core.session.dnsbl.is_empty() && self.data.authenticated_as.is_empty() {
            if let Some(zone) = self.check_dnsbl().await {
                tracing::info!(parent: &self.span,
                    context = "dnsbl",
                    event = "reject",
                    remote_ip = %self.data.remote_ip,
                    zone = zone,
                );
                return self
                    .write(b"554 5.7.1 Your IP address is listed on a blocklist.\r\n")
                    .await;
            }
        }

        let (address, address_lcase, domain) = if !from.address.is_empty() {
            let address_lcase = from.address.to_lowercase();
            let domain = address_lcase
                .rsplit_once('@')
                .map(|(_, d)| d.to_string())
                .unwrap_or_default();
            (from.address, address_lcase, domain)
        } else {
            (String::new(), String::new(), String::new())
        };

        if !address.is_ascii() && (from.flags & MAIL_SMTPUTF8) == 0 {
            return self
                .write(b"553 5.6.7 SMTPUTF8 is required for non-ASCII addresses.\r\n")
                .await;
        }
        if (from.flags & MAIL_REQUIRETLS) != 0 && !self.stream.is_tls() {
            return self
                .write(b"530 5.7.4 REQUIRETLS requires a TLS connection.\r\n")
                .await;
        }
        if from.size > 0 && from.size > self.params.max_message_size {
            return self
                .write(b"552 5.3.4 Message too big for system.\r\n")
                .await;
        }

        // The authenticated user must own the sender address.
        if !self.data.authenticated_as.is_empty()
            && self.params.auth_match_sender
            && !address_lcase.is_empty()
            && self.data.authenticated_as != address_lcase
            && !self.data.authenticated_emails.iter().any(|e| {
                e == &address_lcase || (e.starts_with('@') && address_lcase.ends_with(e.as_str()))
            })
        {
            return self
                .write(b"501 5.5.4 You are not allowed to send from this address.\r\n")
                .await;
        }

        self.data.declared_size = from.size;
        self.data.mail_from = SessionAddress {
            address,
            address_lcase,
            domain,
            flags: from.flags,
            dsn_info: from.env_id,
        }
        .into();

        // SPF on the MAIL FROM identity; a null reverse path was already
        // covered by the HELO identity.
        let mail_from = self.data.mail_from.as_ref().unwrap();
        if self.params.spf_mail_from.verify() && !mail_from.address.is_empty() {
            let spf_output = verify_spf(
                &self.core.core.resolver,
                self.data.remote_ip,
                &self.data.helo_domain,
                &self.instance.hostname,
                &mail_from.address_lcase,
            )
            .await;

            tracing::debug!(parent: &self.span,
                context = "spf",
                event = "lookup",
                identity = "mail-from",
                sender = mail_from.address.as_str(),
                result = %spf_output.result(),
            );

            if self
                .handle_spf(&spf_output, self.params.spf_mail_from.is_strict())
                .await?
            {
                self.data.spf_mail_from = spf_output.into();
            } else {
                self.data.mail_from = None;
                return Ok(());
            }
        }

        tracing::debug!(parent: &self.span,
            context = "mail-from",
            event = "success",
            address = self.data.mail_from.as_ref().unwrap().address.as_str());

        self.write(b"250 2.1.0 OK\r\n").await
    }

    pub async fn handle_spf(&mut self, spf_output: &SpfOutput, strict: bool) -> Result<bool, ()> {
        match spf_output.result() {
            SpfResult::Pass => Ok(true),
            SpfResult::TempError if strict => {
                self.write(b"451 4.7.24 Temporary SPF validation error.\r\n")
                    .await?;
                Ok(false)
            }
            result => {
                if strict {
                    self.write(
                        format!("550 5.7.23 SPF validation failed, status: {result}.\r\n")
                            .as_bytes(),
                    )
                    .await?;
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
        }
    }

    /// Returns the first DNSBL zone listing the remote address.
    async fn check_dnsbl(&self) -> Option<String> {
        let reversed = match self.data.remote_ip {
            std::net::IpAddr::V4(ip) => {
                let octets = ip.octets();
                format!("{}.{}.{}.{}", octets[3], octets[2], octets[1], octets[0])
            }
            std::net::IpAddr::V6(ip) => {
                let mut nibbles = String::with_capacity(63);
                for byte in ip.octets().iter().rev() {
                    if !nibbles.is_empty() {
                        nibbles.push('.');
                    }
                    use std::fmt::Write;
                    let _ = write!(nibbles, "{:x}.{:x}", byte & 0xf, byte >> 4);
                }
                nibbles
            }
        };
        for zone in &self.core.core.session.dnsbl {
            if matches!(
                self.core
                    .core
                    .resolver
                    .exists_ip(&format!("{reversed}.{zone}"))
                    .await,
                Ok(true)
            ) {
                return Some(zone.clone());
            }
        }
        None
    }
}
