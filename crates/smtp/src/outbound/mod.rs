/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

use auth::DnsError;
use common::config::{RelayHost, RelayProtocol, RequireOptional};
use smtp_proto::Severity;

use crate::queue::{Error, ErrorDetails, HostResponse, Status};

use self::client::ClientError;

pub mod client;
pub mod dane;
pub mod delivery;
pub mod lookup;
pub mod mta_sts;
pub mod session;

pub enum NextHop<'x> {
    Relay(&'x RelayHost),
    Mx(&'x str),
}

impl<'x> NextHop<'x> {
    #[inline(always)]
    pub fn hostname(&self) -> &str {
        match self {
            NextHop::Mx(host) => host.strip_suffix('.').unwrap_or(host),
            NextHop::Relay(host) => host.address.as_str(),
        }
    }

    #[inline(always)]
    pub fn fqdn_hostname(&self) -> Cow<'_, str> {
        let host = match self {
            NextHop::Mx(host) => host,
            NextHop::Relay(host) => host.address.as_str(),
        };
        if host.ends_with('.') {
            (*host).into()
        } else {
            format!("{host}.").into()
        }
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        match self {
            NextHop::Mx(_) => 25,
            NextHop::Relay(host) => host.port,
        }
    }

    #[inline(always)]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self {
            NextHop::Mx(_) => None,
            NextHop::Relay(host) => host
                .username
                .as_deref()
                .zip(host.secret.as_deref()),
        }
    }

    #[inline(always)]
    pub fn allow_invalid_certs(&self) -> bool {
        match self {
            NextHop::Mx(_) => false,
            NextHop::Relay(host) => host.tls_allow_invalid_certs,
        }
    }

    #[inline(always)]
    pub fn implicit_tls(&self) -> bool {
        match self {
            NextHop::Mx(_) => false,
            NextHop::Relay(host) => host.tls_implicit,
        }
    }

    #[inline(always)]
    pub fn is_smtp(&self) -> bool {
        match self {
            NextHop::Mx(_) => true,
            NextHop::Relay(host) => host.protocol == RelayProtocol::Smtp,
        }
    }
}

/// Aggregated TLS requirements for one delivery; the most restrictive
/// applicable policy wins.
#[derive(Debug, Clone, Copy)]
pub struct TlsStrategy {
    pub dane: RequireOptional,
    pub mta_sts: RequireOptional,
    pub tls: RequireOptional,
}

impl TlsStrategy {
    #[inline(always)]
    pub fn try_dane(&self) -> bool {
        matches!(
            self.dane,
            RequireOptional::Require | RequireOptional::Optional
        )
    }

    #[inline(always)]
    pub fn is_dane_required(&self) -> bool {
        matches!(self.dane, RequireOptional::Require)
    }

    #[inline(always)]
    pub fn try_mta_sts(&self) -> bool {
        matches!(
            self.mta_sts,
            RequireOptional::Require | RequireOptional::Optional
        )
    }

    #[inline(always)]
    pub fn is_mta_sts_required(&self) -> bool {
        matches!(self.mta_sts, RequireOptional::Require)
    }

    #[inline(always)]
    pub fn try_start_tls(&self) -> bool {
        matches!(
            self.tls,
            RequireOptional::Require | RequireOptional::Optional
        )
    }

    #[inline(always)]
    pub fn is_tls_required(&self) -> bool {
        matches!(self.tls, RequireOptional::Require)
            || self.is_dane_required()
            || self.is_mta_sts_required()
    }
}

impl Status<(), Error> {
    pub fn from_client_error(hostname: &str, command: &str, err: ClientError) -> Self {
        match err {
            ClientError::Io(_)
            | ClientError::Timeout
            | ClientError::UnparseableReply
            | ClientError::Tls(_) => Status::TemporaryFailure(Error::ConnectionError(
                ErrorDetails {
                    entity: hostname.to_string(),
                    details: err.to_string(),
                },
            )),
            ClientError::UnexpectedReply(response) => {
                let details = ErrorDetails {
                    entity: hostname.to_string(),
                    details: command.trim().to_string(),
                };
                if response.severity() == Severity::PermanentNegativeCompletion {
                    Status::PermanentFailure(Error::UnexpectedResponse(HostResponse {
                        hostname: details,
                        response,
                    }))
                } else {
                    Status::TemporaryFailure(Error::UnexpectedResponse(HostResponse {
                        hostname: details,
                        response,
                    }))
                }
            }
            ClientError::InvalidTlsName | ClientError::MissingStartTls => {
                Status::PermanentFailure(Error::TlsError(ErrorDetails {
                    entity: hostname.to_string(),
                    details: err.to_string(),
                }))
            }
        }
    }

    pub fn from_starttls_error(hostname: &str, err: ClientError) -> Self {
        match err {
            ClientError::MissingStartTls => Status::PermanentFailure(Error::TlsError(
                ErrorDetails {
                    entity: hostname.to_string(),
                    details: "STARTTLS not advertised by host.".to_string(),
                },
            )),
            ClientError::UnexpectedReply(response) => {
                let details = ErrorDetails {
                    entity: hostname.to_string(),
                    details: "STARTTLS".to_string(),
                };
                if response.severity() == Severity::PermanentNegativeCompletion {
                    Status::PermanentFailure(Error::UnexpectedResponse(HostResponse {
                        hostname: details,
                        response,
                    }))
                } else {
                    Status::TemporaryFailure(Error::UnexpectedResponse(HostResponse {
                        hostname: details,
                        response,
                    }))
                }
            }
            err => Status::from_tls_error(hostname, err),
        }
    }

    pub fn from_tls_error(hostname: &str, err: ClientError) -> Self {
        match err {
            ClientError::InvalidTlsName => Status::PermanentFailure(Error::TlsError(
                ErrorDetails {
                    entity: hostname.to_string(),
                    details: "Invalid hostname".to_string(),
                },
            )),
            ClientError::Timeout => Status::TemporaryFailure(Error::TlsError(ErrorDetails {
                entity: hostname.to_string(),
                details: "TLS handshake timed out".to_string(),
            })),
            ClientError::Tls(err) => Status::TemporaryFailure(Error::TlsError(ErrorDetails {
                entity: hostname.to_string(),
                details: format!("Handshake failed: {err}"),
            })),
            ClientError::Io(err) => Status::TemporaryFailure(Error::TlsError(ErrorDetails {
                entity: hostname.to_string(),
                details: format!("I/O error: {err}"),
            })),
            _ => Status::PermanentFailure(Error::TlsError(ErrorDetails {
                entity: hostname.to_string(),
                details: "Other TLS error".to_string(),
            })),
        }
    }
}

impl From<DnsError> for Status<(), Error> {
    fn from(err: DnsError) -> Self {
        match &err {
            DnsError::NotFound => {
                Status::PermanentFailure(Error::DnsError("Domain not found".to_string()))
            }
            DnsError::Permanent(err) => Status::PermanentFailure(Error::DnsError(err.clone())),
            DnsError::Temporary(err) => Status::TemporaryFailure(Error::DnsError(err.clone())),
        }
    }
}
