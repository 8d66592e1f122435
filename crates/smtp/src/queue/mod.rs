/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt::Display,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use common::listener::limiter::ConcurrencyLimiter;
use serde::{Deserialize, Serialize};
use smtp_proto::Response;
use tokio::sync::oneshot;

pub mod dsn;
pub mod manager;
pub mod quota;
pub mod serialize;
pub mod spool;
pub mod throttle;

pub type QueueId = u64;

#[derive(Debug)]
pub enum Event {
    Queue(Schedule<Box<Message>>),
    Done(WorkerResult),
    Manage(QueueRequest),
    Stop,
}

#[derive(Debug)]
pub enum WorkerResult {
    Done,
    Retry(Schedule<Box<Message>>),
    OnHold(OnHold<Box<Message>>),
}

/// Administrative operations; they serialize with delivery through the
/// manager's event loop.
#[derive(Debug)]
pub enum QueueRequest {
    List {
        result_tx: oneshot::Sender<Vec<QueueId>>,
    },
    /// Retry now.
    Kick {
        id: QueueId,
        result_tx: oneshot::Sender<bool>,
    },
    /// Delete the entry without sending a DSN.
    Drop {
        id: QueueId,
        result_tx: oneshot::Sender<bool>,
    },
    /// Reschedule and/or change the transport.
    Save {
        id: QueueId,
        due: Option<u64>,
        transport: Option<String>,
        result_tx: oneshot::Sender<bool>,
    },
}

#[derive(Debug)]
pub struct OnHold<T> {
    pub next_due: Option<u64>,
    pub limiters: Vec<ConcurrencyLimiter>,
    pub message: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule<T> {
    pub due: u64,
    pub inner: T,
}

/// Ordered by due time alone.
impl<T> PartialEq for Schedule<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl<T> Eq for Schedule<T> {}

impl<T> PartialOrd for Schedule<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Schedule<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due)
    }
}

impl<T: Default> Schedule<T> {
    pub fn now() -> Self {
        Schedule {
            due: now(),
            inner: T::default(),
        }
    }

    pub fn later(duration: Duration) -> Self {
        Schedule {
            due: now() + duration.as_secs(),
            inner: T::default(),
        }
    }
}

#[derive(Debug)]
pub struct Message {
    pub id: QueueId,
    pub created: u64,
    pub path: PathBuf,

    pub return_path: String,
    pub return_path_lcase: String,
    pub return_path_domain: String,
    pub recipients: Vec<Recipient>,
    pub domains: Vec<Domain>,

    pub flags: u64,
    pub env_id: Option<String>,
    pub priority: i16,
    pub transport: Option<String>,

    pub size: usize,
    pub quota_refs: Vec<quota::UsedQuota>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Domain {
    pub domain: String,
    pub retry: Schedule<u32>,
    pub notify: Schedule<u32>,
    pub expires: u64,
    pub status: Status<(), Error>,
    pub changed: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Recipient {
    pub domain_idx: usize,
    pub address: String,
    pub address_lcase: String,
    pub status: Status<HostResponse<String>, HostResponse<ErrorDetails>>,
    pub flags: u64,
    pub orcpt: Option<String>,
}

pub const RCPT_DSN_SENT: u64 = 1 << 32;
pub const RCPT_STATUS_CHANGED: u64 = 2 << 32;

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Status<T, E> {
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "completed")]
    Completed(T),
    #[serde(rename = "temp_fail")]
    TemporaryFailure(E),
    #[serde(rename = "perm_fail")]
    PermanentFailure(E),
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct HostResponse<T> {
    pub hostname: T,
    pub response: Response<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Error {
    DnsError(String),
    /// The domain published a null MX (RFC 7505) and accepts no mail.
    NullMx,
    UnexpectedResponse(HostResponse<ErrorDetails>),
    ConnectionError(ErrorDetails),
    TlsError(ErrorDetails),
    DaneError(ErrorDetails),
    MtaStsError(String),
    RateLimited,
    ConcurrencyLimited,
    Io(String),
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub entity: String,
    pub details: String,
}

pub struct DeliveryAttempt {
    pub span: tracing::Span,
    pub message: Box<Message>,
}

impl From<Box<Message>> for DeliveryAttempt {
    fn from(message: Box<Message>) -> Self {
        DeliveryAttempt {
            span: tracing::info_span!(
                "delivery",
                "id" = message.id,
                "return_path" = if !message.return_path.is_empty() {
                    message.return_path.as_str()
                } else {
                    "<>"
                },
                "nrcpt" = message.recipients.len(),
                "size" = message.size,
            ),
            message,
        }
    }
}

impl Message {
    /// The soonest retry, notification or expiry instant across domains
    /// still pending delivery, if any.
    pub fn next_event(&self) -> Option<u64> {
        let mut next_event = None;
        for domain in &self.domains {
            if matches!(
                domain.status,
                Status::Scheduled | Status::TemporaryFailure(_)
            ) {
                for due in [domain.retry.due, domain.notify.due, domain.expires] {
                    if next_event.map_or(true, |ne| due < ne) {
                        next_event = Some(due);
                    }
                }
            }
        }
        next_event
    }

    pub fn next_delivery_event(&self) -> u64 {
        self.domains
            .iter()
            .filter(|d| matches!(d.status, Status::Scheduled | Status::TemporaryFailure(_)))
            .map(|d| d.retry.due)
            .min()
            .unwrap_or_else(now)
    }

    pub fn next_dsn(&self) -> u64 {
        self.domains
            .iter()
            .filter(|d| matches!(d.status, Status::Scheduled | Status::TemporaryFailure(_)))
            .map(|d| d.notify.due)
            .min()
            .unwrap_or_else(now)
    }

    pub fn expires(&self) -> u64 {
        self.domains
            .iter()
            .filter(|d| matches!(d.status, Status::Scheduled | Status::TemporaryFailure(_)))
            .map(|d| d.expires)
            .min()
            .unwrap_or_else(now)
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: u64) -> bool {
        (self.flags & flag) != 0
    }
}

impl Recipient {
    #[inline(always)]
    pub fn has_flag(&self, flag: u64) -> bool {
        (self.flags & flag) != 0
    }
}

impl Domain {
    pub fn set_status(
        &mut self,
        status: impl Into<Status<(), Error>>,
        config: &common::config::QueueConfig,
    ) {
        self.status = status.into();
        self.changed = true;
        if matches!(
            &self.status,
            Status::TemporaryFailure(_) | Status::Scheduled
        ) {
            self.retry(config);
        }
    }

    /// Exponential backoff: attempts are totally ordered and the next due
    /// time strictly increases until terminal.
    pub fn retry(&mut self, config: &common::config::QueueConfig) {
        self.retry.due = now() + config.next_retry(self.retry.inner).as_secs();
        self.retry.inner += 1;
    }
}

impl<T, E> Status<T, E> {
    pub fn into_permanent(self) -> Self {
        match self {
            Status::TemporaryFailure(err) => Status::PermanentFailure(err),
            other => other,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Status::PermanentFailure(_))
    }
}

pub trait DomainPart {
    fn domain_part(&self) -> &str;
}

impl DomainPart for &str {
    #[inline(always)]
    fn domain_part(&self) -> &str {
        self.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

impl DomainPart for String {
    #[inline(always)]
    fn domain_part(&self) -> &str {
        self.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

#[inline(always)]
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnexpectedResponse(response) => {
                write!(
                    f,
                    "Unexpected response from '{}': {}",
                    response.hostname.entity, response.response
                )
            }
            Error::DnsError(err) => {
                write!(f, "DNS lookup failed: {err}")
            }
            Error::NullMx => {
                write!(f, "Domain does not accept messages (null MX)")
            }
            Error::ConnectionError(details) => {
                write!(
                    f,
                    "Connection to '{}' failed: {}",
                    details.entity, details.details
                )
            }
            Error::TlsError(details) => {
                write!(f, "TLS error from '{}': {}", details.entity, details.details)
            }
            Error::DaneError(details) => {
                write!(
                    f,
                    "DANE failed to authenticate '{}': {}",
                    details.entity, details.details
                )
            }
            Error::MtaStsError(details) => {
                write!(f, "MTA-STS auth failed: {details}")
            }
            Error::RateLimited => {
                write!(f, "Rate limited")
            }
            Error::ConcurrencyLimited => {
                write!(f, "Too many concurrent connections to remote server")
            }
            Error::Io(err) => {
                write!(f, "Queue error: {err}")
            }
        }
    }
}

impl Display for Status<(), Error> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Scheduled => write!(f, "Scheduled"),
            Status::Completed(_) => write!(f, "Completed"),
            Status::TemporaryFailure(err) => write!(f, "Temporary Failure: {err}"),
            Status::PermanentFailure(err) => write!(f, "Permanent Failure: {err}"),
        }
    }
}

impl Display for Status<HostResponse<String>, HostResponse<ErrorDetails>> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Scheduled => write!(f, "Scheduled"),
            Status::Completed(response) => write!(f, "Delivered: {}", response.response),
            Status::TemporaryFailure(err) => write!(f, "Temporary Failure: {}", err.response),
            Status::PermanentFailure(err) => write!(f, "Permanent Failure: {}", err.response),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::config::QueueConfig;

    use super::*;

    #[test]
    fn backoff_progression_doubles() {
        let config = QueueConfig::default();
        let mut domain = Domain {
            domain: "b.example".to_string(),
            retry: Schedule::now(),
            notify: Schedule::later(Duration::from_secs(86400)),
            expires: now() + 5 * 86400,
            status: Status::Scheduled,
            changed: false,
        };

        // The interval doubles per attempt from the 7.5 minute base, so in
        // wall-clock terms attempt N lands at the sum of all prior backoffs.
        let t0 = now();
        let mut last_due = t0;
        for expect in [450u64, 900, 1800] {
            domain.set_status(
                Status::TemporaryFailure(Error::Io("connection refused".to_string())),
                &config,
            );
            assert!(
                domain.retry.due >= t0 + expect && domain.retry.due <= t0 + expect + 2,
                "expected ~{expect}, got {}",
                domain.retry.due - t0
            );
            assert!(domain.retry.due > last_due);
            last_due = domain.retry.due;
        }

        // Capped at retry_max.
        domain.retry.inner = 30;
        domain.retry(&config);
        assert!(domain.retry.due <= now() + config.retry_max.as_secs() + 2);
    }

    #[test]
    fn next_event_ignores_terminal_domains() {
        let config = QueueConfig::default();
        let mut message = Message {
            id: 1,
            created: now(),
            path: Default::default(),
            return_path: "a@a.example".to_string(),
            return_path_lcase: "a@a.example".to_string(),
            return_path_domain: "a.example".to_string(),
            recipients: Vec::new(),
            domains: vec![
                Domain {
                    domain: "b.example".to_string(),
                    retry: Schedule { due: 100, inner: 0 },
                    notify: Schedule { due: 200, inner: 0 },
                    expires: 300,
                    status: Status::Scheduled,
                    changed: false,
                },
                Domain {
                    domain: "c.example".to_string(),
                    retry: Schedule { due: 50, inner: 0 },
                    notify: Schedule { due: 60, inner: 0 },
                    expires: 70,
                    status: Status::Completed(()),
                    changed: false,
                },
            ],
            flags: 0,
            env_id: None,
            priority: 0,
            transport: None,
            size: 0,
            quota_refs: Vec::new(),
        };
        assert_eq!(message.next_event(), Some(100));
        assert_eq!(message.next_delivery_event(), 100);

        message.domains[0].set_status(
            Status::PermanentFailure(Error::Io("rejected".to_string())),
            &config,
        );
        assert_eq!(message.next_event(), None);
    }
}
