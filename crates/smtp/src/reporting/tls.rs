/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{io::Write as _, time::Duration};

use ahash::AHashMap;
use auth::{dmarc::verify::verify_external_report_address, tlsrpt::ReportUri};
use flate2::{write::GzEncoder, Compression};
use mail_parser::DateTime;
use serde::{Deserialize, Serialize};

use crate::{core::SMTP, queue::now};

use super::{FailureDetails, PolicyType, TlsEvent};

/// Per-domain aggregate of one reporting window, RFC 8460 §4.
#[derive(Debug, Default)]
pub struct TlsAggregate {
    pub policies: Vec<PolicyAggregate>,
    pub rua: Vec<ReportUri>,
}

#[derive(Debug)]
pub struct PolicyAggregate {
    pub policy: PolicyDetails,
    pub success: u32,
    pub failures: AHashMap<FailureDetails, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDetails {
    #[serde(rename = "policy-type")]
    pub policy_type: String,
    #[serde(rename = "policy-string", skip_serializing_if = "Vec::is_empty", default)]
    pub policy_string: Vec<String>,
    #[serde(rename = "policy-domain")]
    pub policy_domain: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TlsReport {
    #[serde(rename = "organization-name", skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(rename = "date-range")]
    pub date_range: DateRange,
    #[serde(rename = "contact-info", skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,
    #[serde(rename = "report-id")]
    pub report_id: String,
    pub policies: Vec<PolicyEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(rename = "start-datetime")]
    pub start_datetime: String,
    #[serde(rename = "end-datetime")]
    pub end_datetime: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub policy: PolicyDetails,
    pub summary: Summary,
    #[serde(rename = "failure-details", skip_serializing_if = "Vec::is_empty", default)]
    pub failure_details: Vec<FailureDetails>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Summary {
    #[serde(rename = "total-successful-session-count")]
    pub total_success: u32,
    #[serde(rename = "total-failure-session-count")]
    pub total_failure: u32,
}

impl TlsAggregate {
    pub fn record(&mut self, event: TlsEvent) {
        self.rua = event.rua;
        let policy = PolicyDetails::from(&event.policy, &event.domain);
        let idx = match self
            .policies
            .iter()
            .position(|aggregate| aggregate.policy == policy)
        {
            Some(idx) => idx,
            None => {
                self.policies.push(PolicyAggregate {
                    policy,
                    success: 0,
                    failures: AHashMap::new(),
                });
                self.policies.len() - 1
            }
        };
        let entry = &mut self.policies[idx];
        match event.failure {
            Some(failure) => *entry.failures.entry(failure).or_insert(0) += 1,
            None => entry.success += 1,
        }
    }
}

impl PolicyDetails {
    fn from(policy: &PolicyType, domain: &str) -> Self {
        let mut policy_string = Vec::new();
        match policy {
            PolicyType::Sts(Some(sts)) => {
                for line in sts.to_string().lines() {
                    policy_string.push(line.to_string());
                }
            }
            PolicyType::Tlsa(Some(tlsa)) => {
                for entry in &tlsa.entries {
                    policy_string.push(format!(
                        "{} {} {} {}",
                        if entry.is_end_entity { 3 } else { 2 },
                        u8::from(entry.is_spki),
                        if entry.is_sha256 { 1 } else { 2 },
                        entry
                            .data
                            .iter()
                            .map(|byte| format!("{byte:02x}"))
                            .collect::<String>()
                    ));
                }
            }
            _ => (),
        }
        PolicyDetails {
            policy_type: <&'static str>::from(policy).to_string(),
            policy_string,
            policy_domain: domain.to_string(),
        }
    }
}

impl SMTP {
    /// Builds, compresses and dispatches the aggregate report for one
    /// domain, then drops the aggregate.
    pub async fn send_tls_report(&self, domain: String, aggregate: TlsAggregate, range_start: u64) {
        let span = tracing::info_span!(
            "tls-report",
            domain = domain.as_str(),
            range_from = range_start,
            range_to = now(),
        );

        let report = TlsReport {
            organization_name: self.core.report.org_name.clone(),
            date_range: DateRange {
                start_datetime: DateTime::from_timestamp(range_start as i64).to_rfc3339(),
                end_datetime: DateTime::from_timestamp(now() as i64).to_rfc3339(),
            },
            contact_info: self.core.report.contact_info.clone(),
            report_id: format!("{range_start}_{domain}"),
            policies: aggregate
                .policies
                .into_iter()
                .map(|entry| {
                    let total_failure = entry.failures.values().sum();
                    PolicyEntry {
                        policy: entry.policy,
                        summary: Summary {
                            total_success: entry.success,
                            total_failure,
                        },
                        failure_details: entry
                            .failures
                            .into_iter()
                            .map(|(mut failure, count)| {
                                failure.failed_session_count = count;
                                failure
                            })
                            .collect(),
                    }
                })
                .collect(),
        };
        if report.policies.is_empty() {
            return;
        }

        let json = match serde_json::to_vec(&report) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(parent: &span,
                    event = "error",
                    "Failed to serialize report: {err}");
                return;
            }
        };
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len()), Compression::default());
        let compressed = match encoder.write_all(&json).and_then(|_| encoder.finish()) {
            Ok(compressed) => compressed,
            Err(err) => {
                tracing::error!(parent: &span,
                    event = "error",
                    "Failed to compress report: {err}");
                return;
            }
        };

        // HTTPS submission is preferred; any success completes the report.
        let mut mail_rcpts = Vec::new();
        for uri in &aggregate.rua {
            match uri {
                ReportUri::Http(url) => {
                    match reqwest::Client::builder()
                        .user_agent(common::USER_AGENT)
                        .timeout(Duration::from_secs(2 * 60))
                        .build()
                    {
                        Ok(client) => match client
                            .post(url)
                            .header(reqwest::header::CONTENT_TYPE, "application/tlsrpt+gzip")
                            .body(compressed.clone())
                            .send()
                            .await
                        {
                            Ok(response) if response.status().is_success() => {
                                tracing::info!(parent: &span,
                                    context = "http",
                                    event = "success",
                                    url = url.as_str());
                                return;
                            }
                            Ok(response) => {
                                tracing::debug!(parent: &span,
                                    context = "http",
                                    event = "invalid-response",
                                    url = url.as_str(),
                                    status = %response.status());
                            }
                            Err(err) => {
                                tracing::debug!(parent: &span,
                                    context = "http",
                                    event = "error",
                                    url = url.as_str(),
                                    reason = %err);
                            }
                        },
                        Err(err) => {
                            tracing::debug!(parent: &span,
                                context = "http",
                                event = "error",
                                reason = %err);
                        }
                    }
                }
                ReportUri::Mail(address) => {
                    // External report addresses need the opt-in record.
                    if verify_external_report_address(&self.core.resolver, &domain, address).await
                    {
                        mail_rcpts.push(address.clone());
                    } else {
                        tracing::info!(parent: &span,
                            context = "report",
                            event = "no-opt-in",
                            rcpt = address.as_str(),
                            "External report address without opt-in record, skipped.");
                    }
                }
            }
        }

        if mail_rcpts.is_empty() {
            return;
        }
        let from_addr = self.core.report.tls_from.clone();
        let submitter = self.core.report.submitter.clone();
        let mut builder = mail_builder::MessageBuilder::new()
            .from((self.core.report.org_name.clone().unwrap_or_default(), from_addr.clone()))
            .subject(format!(
                "Report Domain: {domain} Submitter: {submitter} Report-ID: <{}>",
                report.report_id
            ))
            .header(
                "TLS-Report-Domain",
                mail_builder::headers::HeaderType::Text(domain.clone().into()),
            )
            .header(
                "TLS-Report-Submitter",
                mail_builder::headers::HeaderType::Text(submitter.clone().into()),
            )
            .text_body("TLS aggregate report attached.")
            .attachment(
                "application/tlsrpt+gzip",
                format!("{submitter}!{domain}!{range_start}.json.gz"),
                compressed,
            );
        for rcpt in &mail_rcpts {
            builder = builder.to(rcpt.as_str());
        }
        let report_message = match builder.write_to_vec() {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(parent: &span,
                    event = "error",
                    "Failed to build report message: {err}");
                return;
            }
        };

        // Queue like any outbound message, DKIM-signed by the local domain.
        let mut message = self.new_message(from_addr, None);
        for rcpt in mail_rcpts {
            message.add_recipient(rcpt, &self.core.queue);
        }
        let signature = self.sign_report(&report_message);
        self.queue_message(message, signature.as_deref(), &report_message, &span)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::ResultType;

    #[test]
    fn aggregate_groups_by_policy_and_failure() {
        let mut aggregate = TlsAggregate::default();
        for _ in 0..3 {
            aggregate.record(TlsEvent {
                domain: "b.example".to_string(),
                policy: PolicyType::NoPolicyFound,
                failure: None,
                rua: vec![ReportUri::Mail("tls@b.example".to_string())],
            });
        }
        aggregate.record(TlsEvent {
            domain: "b.example".to_string(),
            policy: PolicyType::NoPolicyFound,
            failure: Some(FailureDetails::new(ResultType::StartTlsNotSupported)),
            rua: vec![ReportUri::Mail("tls@b.example".to_string())],
        });
        aggregate.record(TlsEvent {
            domain: "b.example".to_string(),
            policy: PolicyType::NoPolicyFound,
            failure: Some(FailureDetails::new(ResultType::StartTlsNotSupported)),
            rua: vec![ReportUri::Mail("tls@b.example".to_string())],
        });

        assert_eq!(aggregate.policies.len(), 1);
        let entry = &aggregate.policies[0];
        assert_eq!(entry.success, 3);
        assert_eq!(entry.failures.len(), 1);
        assert_eq!(
            entry.failures.values().copied().collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[test]
    fn report_json_field_names() {
        let report = TlsReport {
            organization_name: Some("Example Org".to_string()),
            date_range: DateRange {
                start_datetime: "2024-08-01T00:00:00Z".to_string(),
                end_datetime: "2024-08-02T00:00:00Z".to_string(),
            },
            contact_info: None,
            report_id: "1_b.example".to_string(),
            policies: vec![PolicyEntry {
                policy: PolicyDetails {
                    policy_type: "sts".to_string(),
                    policy_string: vec!["version: STSv1".to_string()],
                    policy_domain: "b.example".to_string(),
                },
                summary: Summary {
                    total_success: 10,
                    total_failure: 1,
                },
                failure_details: vec![FailureDetails::new(ResultType::ValidationFailure)],
            }],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"organization-name\""), "{json}");
        assert!(json.contains("\"total-successful-session-count\":10"), "{json}");
        assert!(json.contains("\"result-type\":\"validation-failure\""), "{json}");
        assert!(json.contains("\"policy-domain\":\"b.example\""), "{json}");
    }
}
