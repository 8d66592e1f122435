/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use ahash::AHashMap;
use auth::dkim::DkimSigner;

pub mod tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerProtocol {
    Smtp,
    Submission,
}

impl ServerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerProtocol::Smtp => "smtp",
            ServerProtocol::Submission => "submission",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStrategy {
    Disable,
    Relaxed,
    Strict,
}

impl VerifyStrategy {
    #[inline(always)]
    pub fn verify(&self) -> bool {
        matches!(self, VerifyStrategy::Relaxed | VerifyStrategy::Strict)
    }

    #[inline(always)]
    pub fn is_strict(&self) -> bool {
        matches!(self, VerifyStrategy::Strict)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequireOptional {
    Disable,
    Optional,
    Require,
}

#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub requests: u64,
    pub period: Duration,
}

pub struct ListenerConfig {
    pub id: String,
    pub addr: SocketAddr,
    pub protocol: ServerProtocol,
    pub tls_implicit: bool,
    pub max_connections: u64,
}

pub struct SessionConfig {
    pub timeout: Duration,
    pub duration: Duration,
    pub max_message_size: usize,
    pub max_rcpt: usize,
    pub max_messages: usize,
    pub max_received_headers: usize,
    pub ehlo_require: bool,
    pub ehlo_reject_non_fqdn: bool,
    pub auth_require: bool,
    pub auth_match_sender: bool,
    pub auth_rate: Rate,
    pub bad_command_limit: u64,
    pub max_connections_per_ip: u64,
    pub spf_ehlo: VerifyStrategy,
    pub spf_mail_from: VerifyStrategy,
    pub iprev: VerifyStrategy,
    pub dkim: VerifyStrategy,
    pub dmarc: VerifyStrategy,
    pub dnsbl: Vec<String>,
    pub first_time_sender_delay: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeout: Duration::from_secs(5 * 60),
            duration: Duration::from_secs(60 * 60),
            max_message_size: 25 * 1024 * 1024,
            max_rcpt: 100,
            max_messages: 10,
            max_received_headers: 50,
            ehlo_require: true,
            ehlo_reject_non_fqdn: false,
            auth_require: false,
            auth_match_sender: true,
            auth_rate: Rate {
                requests: 5,
                period: Duration::from_secs(60),
            },
            bad_command_limit: 10,
            max_connections_per_ip: 8,
            spf_ehlo: VerifyStrategy::Relaxed,
            spf_mail_from: VerifyStrategy::Relaxed,
            iprev: VerifyStrategy::Relaxed,
            dkim: VerifyStrategy::Relaxed,
            // Published reject/quarantine policies are honored.
            dmarc: VerifyStrategy::Strict,
            dnsbl: Vec::new(),
            first_time_sender_delay: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayProtocol {
    Smtp,
    Lmtp,
}

/// A named next-hop used instead of direct MX delivery, including SOCKS or
/// smarthost style relays configured by the operator.
pub struct RelayHost {
    pub address: String,
    pub port: u16,
    pub protocol: RelayProtocol,
    pub tls_implicit: bool,
    pub tls_allow_invalid_certs: bool,
    pub username: Option<String>,
    pub secret: Option<String>,
}

pub struct QueueTlsConfig {
    pub dane: RequireOptional,
    pub mta_sts: RequireOptional,
    pub start: RequireOptional,
}

pub struct QueueTimeouts {
    pub connect: Duration,
    pub greeting: Duration,
    pub tls: Duration,
    pub ehlo: Duration,
    pub mail: Duration,
    pub rcpt: Duration,
    pub data: Duration,
    pub mta_sts: Duration,
}

impl Default for QueueTimeouts {
    fn default() -> Self {
        QueueTimeouts {
            connect: Duration::from_secs(5 * 60),
            greeting: Duration::from_secs(5 * 60),
            tls: Duration::from_secs(3 * 60),
            ehlo: Duration::from_secs(5 * 60),
            mail: Duration::from_secs(5 * 60),
            rcpt: Duration::from_secs(5 * 60),
            data: Duration::from_secs(10 * 60),
            mta_sts: Duration::from_secs(10 * 60),
        }
    }
}

pub struct QueueConfig {
    pub path: PathBuf,
    pub hash: u64,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub notify: Vec<Duration>,
    pub expire: Duration,
    pub max_attempts: u32,
    pub max_threads: usize,
    pub max_concurrent_per_domain: usize,
    pub max_mx: usize,
    pub max_multihomed: usize,
    pub source_ipv4: Vec<Ipv4Addr>,
    pub source_ipv6: Vec<Ipv6Addr>,
    pub tls: QueueTlsConfig,
    pub timeouts: QueueTimeouts,
    pub transports: AHashMap<String, RelayHost>,
    pub max_queue_size: usize,
    pub max_queue_messages: usize,
    pub dsn_name: String,
    pub dsn_address: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            path: PathBuf::from("./queue"),
            hash: 64,
            retry_base: Duration::from_secs(450),
            retry_max: Duration::from_secs(4 * 3600),
            notify: vec![Duration::from_secs(86400), Duration::from_secs(3 * 86400)],
            expire: Duration::from_secs(5 * 86400),
            max_attempts: 30,
            max_threads: 25,
            max_concurrent_per_domain: 2,
            max_mx: 7,
            max_multihomed: 2,
            source_ipv4: Vec::new(),
            source_ipv6: Vec::new(),
            tls: QueueTlsConfig {
                dane: RequireOptional::Optional,
                mta_sts: RequireOptional::Optional,
                start: RequireOptional::Optional,
            },
            timeouts: QueueTimeouts::default(),
            transports: AHashMap::new(),
            max_queue_size: 10 * 1024 * 1024 * 1024,
            max_queue_messages: 100_000,
            dsn_name: "Mail Delivery Subsystem".to_string(),
            dsn_address: "MAILER-DAEMON@localhost".to_string(),
        }
    }
}

/// Exponential retry: base doubles per attempt, capped. The first retry lands
/// at `retry_base` (~7.5 minutes) after the initial failure.
impl QueueConfig {
    pub fn next_retry(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        std::cmp::min(self.retry_base.saturating_mul(factor as u32), self.retry_max)
    }
}

pub struct MailAuthConfig {
    pub signers: AHashMap<String, Vec<Arc<DkimSigner>>>,
    pub sign_local: Vec<Arc<DkimSigner>>,
    pub local_domains: Vec<String>,
}

impl MailAuthConfig {
    pub fn signers_for(&self, domain: &str) -> &[Arc<DkimSigner>] {
        self.signers
            .get(domain)
            .map(|s| s.as_slice())
            .unwrap_or_default()
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains.iter().any(|d| d == domain)
    }
}

impl Default for MailAuthConfig {
    fn default() -> Self {
        MailAuthConfig {
            signers: AHashMap::new(),
            sign_local: Vec::new(),
            local_domains: Vec::new(),
        }
    }
}

pub struct ReportConfig {
    pub path: PathBuf,
    pub submitter: String,
    pub org_name: Option<String>,
    pub contact_info: Option<String>,
    pub tls_interval: Duration,
    pub tls_from: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            path: PathBuf::from("./reports"),
            submitter: "localhost".to_string(),
            org_name: None,
            contact_info: None,
            tls_interval: Duration::from_secs(86400),
            tls_from: "noreply-tls-reports@localhost".to_string(),
        }
    }
}
