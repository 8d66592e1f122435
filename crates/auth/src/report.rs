/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{fmt::Write, net::IpAddr};

use crate::{
    dkim::DkimOutput,
    dmarc::{DmarcOutput, DmarcResult},
    iprev::IprevOutput,
    spf::{SpfIdentity, SpfOutput},
};

/// Builds the `Authentication-Results` header recorded by the receiving MTA,
/// RFC 8601.
pub struct AuthenticationResults {
    value: String,
    has_results: bool,
}

impl AuthenticationResults {
    pub fn new(hostname: &str) -> Self {
        AuthenticationResults {
            value: hostname.to_string(),
            has_results: false,
        }
    }

    pub fn with_dkim_results(mut self, outputs: &[DkimOutput]) -> Self {
        self.has_results |= !outputs.is_empty();
        for output in outputs {
            let _ = write!(self.value, ";\r\n\tdkim={}", output.result().as_str());
            if let Some(signature) = output.signature() {
                let _ = write!(
                    self.value,
                    " header.d={} header.s={}",
                    signature.domain, signature.selector
                );
                if let Some(identity) = &signature.identity {
                    let _ = write!(self.value, " header.i={identity}");
                }
            }
        }
        self
    }

    pub fn with_spf_result(mut self, output: &SpfOutput, remote_ip: IpAddr, sender: &str) -> Self {
        self.has_results = true;
        let _ = write!(
            self.value,
            ";\r\n\tspf={} smtp.{}={} (remote ip {})",
            output.result().as_str(),
            match output.identity {
                SpfIdentity::MailFrom => "mailfrom",
                SpfIdentity::Helo => "helo",
            },
            if !sender.is_empty() {
                sender
            } else {
                &output.domain
            },
            remote_ip,
        );
        self
    }

    pub fn with_iprev_result(mut self, output: &IprevOutput, remote_ip: IpAddr) -> Self {
        self.has_results = true;
        let _ = write!(
            self.value,
            ";\r\n\tiprev={} policy.iprev={}",
            output.result.as_str(),
            remote_ip
        );
        if let Some(ptr) = output.ptr.first() {
            let _ = write!(self.value, " ({ptr})");
        }
        self
    }

    pub fn with_dmarc_result(mut self, output: &DmarcOutput) -> Self {
        self.has_results = true;
        let _ = write!(
            self.value,
            ";\r\n\tdmarc={} header.from={}",
            output.result().as_str(),
            output.domain
        );
        if output.result() == &DmarcResult::Pass {
            let _ = write!(
                self.value,
                " (aligned via {})",
                if output.dkim_result == DmarcResult::Pass {
                    "dkim"
                } else {
                    "spf"
                }
            );
        }
        let _ = write!(self.value, " policy.dmarc={}", output.policy());
        self
    }

    pub fn write_header(&self, headers: &mut Vec<u8>) {
        headers.extend_from_slice(b"Authentication-Results: ");
        headers.extend_from_slice(self.value.as_bytes());
        if !self.has_results {
            headers.extend_from_slice(b"; none");
        }
        headers.extend_from_slice(b"\r\n");
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

/// The `Received-SPF` header, RFC 7208 §9.1.
pub struct ReceivedSpf {
    value: String,
}

impl ReceivedSpf {
    pub fn new(
        output: &SpfOutput,
        remote_ip: IpAddr,
        helo: &str,
        mail_from: &str,
        hostname: &str,
    ) -> Self {
        let mail_from = if !mail_from.is_empty() {
            mail_from.to_string()
        } else {
            format!("postmaster@{helo}")
        };
        let mut value = String::with_capacity(128);
        let _ = write!(
            value,
            "{} ({hostname}: domain of {mail_from}) receiver={hostname};\r\n\tclient-ip={remote_ip}; envelope-from=\"{mail_from}\"; helo={helo};",
            output.result().as_str(),
        );
        ReceivedSpf { value }
    }

    pub fn write_header(&self, headers: &mut Vec<u8>) {
        headers.extend_from_slice(b"Received-SPF: ");
        headers.extend_from_slice(self.value.as_bytes());
        headers.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dmarc::{Alignment, Policy},
        spf::SpfResult,
    };

    #[test]
    fn dmarc_pass_reports_aligned_identity() {
        let output = DmarcOutput {
            record: None,
            domain: "d.example".to_string(),
            result: DmarcResult::Pass,
            dkim_result: DmarcResult::Pass,
            spf_result: DmarcResult::Fail,
            policy: Policy::None,
            alignment: Alignment::Strict,
        };
        let results = AuthenticationResults::new("mx.local.example").with_dmarc_result(&output);
        assert!(results.as_str().contains("dmarc=pass"), "{}", results.as_str());
        assert!(
            results.as_str().contains("(aligned via dkim)"),
            "{}",
            results.as_str()
        );
    }

    #[test]
    fn header_is_folded_per_method() {
        let spf = SpfOutput {
            result: SpfResult::Pass,
            domain: "a.example".to_string(),
            identity: SpfIdentity::MailFrom,
            explanation: None,
            report: None,
        };
        let mut headers = Vec::new();
        AuthenticationResults::new("mx.local.example")
            .with_spf_result(&spf, "203.0.113.9".parse().unwrap(), "alice@a.example")
            .write_header(&mut headers);
        let text = String::from_utf8(headers).unwrap();
        assert!(text.starts_with("Authentication-Results: mx.local.example;\r\n\t"));
        assert!(text.contains("spf=pass smtp.mailfrom=alice@a.example"));
        assert!(text.ends_with("\r\n"));
    }
}
