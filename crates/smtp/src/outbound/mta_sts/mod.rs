/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use auth::DnsError;

pub mod lookup;
pub mod parse;
pub mod verify;

/// A fetched MTA-STS policy, cached for `max_age` keyed by domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Policy {
    pub id: String,
    pub mode: Mode,
    pub mx: Vec<MxPattern>,
    pub max_age: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Enforce,
    Testing,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MxPattern {
    Equals(String),
    StartsWith(String),
}

#[derive(Debug)]
pub enum Error {
    Dns(DnsError),
    Http(reqwest::Error),
    InvalidPolicy(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Dns(DnsError::NotFound) => f.write_str("Record not found."),
            Error::Dns(err) => write!(f, "DNS lookup error: {err}"),
            Error::Http(err) => {
                if err.is_timeout() {
                    f.write_str("Timeout fetching policy.")
                } else if err.is_connect() {
                    f.write_str("Could not reach policy host.")
                } else if err.is_status()
                    && err
                        .status()
                        .map_or(false, |status| status == reqwest::StatusCode::NOT_FOUND)
                {
                    f.write_str("Policy not found.")
                } else {
                    f.write_str("Failed to fetch policy.")
                }
            }
            Error::InvalidPolicy(err) => write!(f, "Failed to parse policy: {err}"),
        }
    }
}

impl From<DnsError> for Error {
    fn from(err: DnsError) -> Self {
        Error::Dns(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err)
    }
}

impl From<Error> for crate::queue::Status<(), crate::queue::Error> {
    fn from(err: Error) -> Self {
        use crate::queue::{Error as QueueError, Status};
        match &err {
            Error::Dns(DnsError::NotFound) => {
                Status::PermanentFailure(QueueError::MtaStsError("Record not found.".to_string()))
            }
            Error::Dns(DnsError::Permanent(err)) => Status::PermanentFailure(
                QueueError::MtaStsError(format!("DNS lookup error: {err}")),
            ),
            Error::Dns(DnsError::Temporary(err)) => Status::TemporaryFailure(
                QueueError::MtaStsError(format!("DNS lookup error: {err}")),
            ),
            Error::Http(http_err) => {
                if http_err.is_status()
                    && http_err
                        .status()
                        .map_or(false, |status| status == reqwest::StatusCode::NOT_FOUND)
                {
                    Status::PermanentFailure(QueueError::MtaStsError(
                        "Policy not found.".to_string(),
                    ))
                } else {
                    Status::TemporaryFailure(QueueError::MtaStsError(err.to_string()))
                }
            }
            Error::InvalidPolicy(err) => Status::PermanentFailure(QueueError::MtaStsError(
                format!("Failed to parse policy: {err}"),
            )),
        }
    }
}
