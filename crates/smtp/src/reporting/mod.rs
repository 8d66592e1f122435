/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::IpAddr, sync::Arc};

use auth::{dane::Tlsa, tlsrpt::ReportUri};
use serde::{Deserialize, Serialize};

use crate::{core::SMTP, outbound::mta_sts::Policy};

pub mod scheduler;
pub mod tls;

#[derive(Debug)]
pub enum Event {
    Tls(Box<TlsEvent>),
    Stop,
}

/// One delivery attempt's TLS outcome, aggregated by the report scheduler
/// into the daily RFC 8460 report for the recipient domain.
#[derive(Debug)]
pub struct TlsEvent {
    pub domain: String,
    pub policy: PolicyType,
    pub failure: Option<FailureDetails>,
    pub rua: Vec<ReportUri>,
}

#[derive(Debug, Hash, PartialEq, Eq)]
pub enum PolicyType {
    Tlsa(Option<Arc<Tlsa>>),
    Sts(Option<Arc<Policy>>),
    NoPolicyFound,
}

impl From<&PolicyType> for &'static str {
    fn from(policy: &PolicyType) -> Self {
        match policy {
            PolicyType::Tlsa(_) => "tlsa",
            PolicyType::Sts(_) => "sts",
            PolicyType::NoPolicyFound => "no-policy-found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultType {
    #[serde(rename = "starttls-not-supported")]
    StartTlsNotSupported,
    #[serde(rename = "certificate-host-mismatch")]
    CertificateHostMismatch,
    #[serde(rename = "certificate-expired")]
    CertificateExpired,
    #[serde(rename = "certificate-not-trusted")]
    CertificateNotTrusted,
    #[serde(rename = "validation-failure")]
    ValidationFailure,
    #[serde(rename = "tlsa-invalid")]
    TlsaInvalid,
    #[serde(rename = "dnssec-invalid")]
    DnssecInvalid,
    #[serde(rename = "dane-required")]
    DaneRequired,
    #[serde(rename = "sts-policy-fetch-error")]
    StsPolicyFetchError,
    #[serde(rename = "sts-policy-invalid")]
    StsPolicyInvalid,
    #[serde(rename = "sts-webpki-invalid")]
    StsWebpkiInvalid,
    #[serde(rename = "other")]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureDetails {
    #[serde(rename = "result-type")]
    pub result_type: ResultType,
    #[serde(rename = "receiving-mx-hostname", skip_serializing_if = "Option::is_none")]
    pub receiving_mx_hostname: Option<String>,
    #[serde(rename = "receiving-ip", skip_serializing_if = "Option::is_none")]
    pub receiving_ip: Option<IpAddr>,
    #[serde(rename = "failure-reason-code", skip_serializing_if = "Option::is_none")]
    pub failure_reason_code: Option<String>,
    #[serde(rename = "failed-session-count", default)]
    pub failed_session_count: u32,
}

impl FailureDetails {
    pub fn new(result_type: ResultType) -> Self {
        FailureDetails {
            result_type,
            receiving_mx_hostname: None,
            receiving_ip: None,
            failure_reason_code: None,
            failed_session_count: 0,
        }
    }

    pub fn with_receiving_mx_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.receiving_mx_hostname = Some(hostname.into());
        self
    }

    pub fn with_receiving_ip(mut self, ip: IpAddr) -> Self {
        self.receiving_ip = Some(ip);
        self
    }

    pub fn with_failure_reason_code(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason_code = Some(reason.into());
        self
    }
}

impl From<&crate::outbound::mta_sts::Error> for ResultType {
    fn from(err: &crate::outbound::mta_sts::Error) -> Self {
        match err {
            crate::outbound::mta_sts::Error::InvalidPolicy(_) => ResultType::StsPolicyInvalid,
            _ => ResultType::StsPolicyFetchError,
        }
    }
}

impl From<(&Option<Arc<Policy>>, &Option<Arc<Tlsa>>)> for PolicyType {
    fn from((sts, tlsa): (&Option<Arc<Policy>>, &Option<Arc<Tlsa>>)) -> Self {
        match (sts, tlsa) {
            // DANE takes precedence in reporting when both applied.
            (_, Some(tlsa)) => PolicyType::Tlsa(Some(tlsa.clone())),
            (Some(sts), _) => PolicyType::Sts(Some(sts.clone())),
            _ => PolicyType::NoPolicyFound,
        }
    }
}

impl SMTP {
    pub async fn schedule_report(&self, event: TlsEvent) {
        if self.report.tx.send(Event::Tls(Box::new(event))).await.is_err() {
            tracing::warn!(
                context = "report",
                event = "error",
                "Report scheduler channel closed.");
        }
    }
}
