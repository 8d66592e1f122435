/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::net::IpAddr;

use auth::{DnsError, MxEntry};
use common::resolver::IpLookupStrategy;
use rand::{seq::SliceRandom, Rng};

use crate::{
    core::SMTP,
    queue::{Error, ErrorDetails, Status},
};

use super::NextHop;

pub struct IpLookupResult {
    pub source_ip: Option<IpAddr>,
    pub remote_ips: Vec<IpAddr>,
    pub authentic: bool,
}

impl SMTP {
    /// Resolves the candidate addresses for one next hop, preferring
    /// DNSSEC-authentic answers, plus a source address when an outbound
    /// pool is configured.
    pub async fn resolve_host(
        &self,
        remote_host: &NextHop<'_>,
        max_multihomed: usize,
    ) -> Result<IpLookupResult, Status<(), Error>> {
        let remote_ips = self
            .core
            .resolver
            .ip_lookup(
                remote_host.fqdn_hostname().as_ref(),
                IpLookupStrategy::Ipv4thenIpv6,
                max_multihomed,
            )
            .await
            .map_err(|err| {
                if matches!(err, DnsError::NotFound) {
                    Status::PermanentFailure(Error::ConnectionError(ErrorDetails {
                        entity: remote_host.hostname().to_string(),
                        details: "record not found for MX".to_string(),
                    }))
                } else {
                    Status::TemporaryFailure(Error::ConnectionError(ErrorDetails {
                        entity: remote_host.hostname().to_string(),
                        details: format!("lookup error: {err}"),
                    }))
                }
            })?;

        let config = &self.core.queue;
        let source_ip = match remote_ips.records.first() {
            Some(IpAddr::V4(_)) => pick_source(&config.source_ipv4).map(IpAddr::from),
            Some(IpAddr::V6(_)) => pick_source(&config.source_ipv6).map(IpAddr::from),
            None => None,
        };

        Ok(IpLookupResult {
            source_ip,
            authentic: remote_ips.authentic,
            remote_ips: remote_ips.records,
        })
    }
}

fn pick_source<T: Copy>(pool: &[T]) -> Option<T> {
    match pool.len() {
        0 => None,
        1 => pool.first().copied(),
        len => pool.get(rand::thread_rng().gen_range(0..len)).copied(),
    }
}

pub trait ToNextHop {
    fn to_remote_hosts<'x, 'y: 'x>(&'x self, domain: &'y str, max_mx: usize)
        -> Option<Vec<NextHop<'x>>>;
}

impl ToNextHop for Vec<MxEntry> {
    /// Orders MX hosts by preference, shuffling within equal preference. A
    /// single null exchange (".") means the domain accepts no mail; an
    /// empty answer falls back to the implicit MX.
    fn to_remote_hosts<'x, 'y: 'x>(
        &'x self,
        domain: &'y str,
        max_mx: usize,
    ) -> Option<Vec<NextHop<'x>>> {
        if !self.is_empty() {
            let mut remote_hosts = Vec::with_capacity(max_mx);
            'outer: for entry in self.iter() {
                if entry.exchanges.len() > 1 {
                    let mut slice = entry.exchanges.iter().collect::<Vec<_>>();
                    slice.shuffle(&mut rand::thread_rng());
                    for remote_host in slice {
                        remote_hosts.push(NextHop::Mx(remote_host.as_str()));
                        if remote_hosts.len() == max_mx {
                            break 'outer;
                        }
                    }
                } else if let Some(remote_host) = entry.exchanges.first() {
                    // Null MX, RFC 7505.
                    if entry.preference == 0 && (remote_host == "." || remote_host.is_empty()) {
                        return None;
                    }
                    remote_hosts.push(NextHop::Mx(remote_host.as_str()));
                    if remote_hosts.len() == max_mx {
                        break;
                    }
                }
            }
            Some(remote_hosts)
        } else {
            // No MX: the domain itself is the implicit exchange.
            Some(vec![NextHop::Mx(domain)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_mx_means_no_delivery() {
        let mx = vec![MxEntry {
            preference: 0,
            exchanges: vec![".".to_string()],
        }];
        assert!(mx.to_remote_hosts("b.example", 5).is_none());
    }

    #[test]
    fn implicit_mx_fallback() {
        let mx: Vec<MxEntry> = Vec::new();
        let hosts = mx.to_remote_hosts("b.example", 5).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].hostname(), "b.example");
    }

    #[test]
    fn preference_order_is_kept() {
        let mx = vec![
            MxEntry {
                preference: 5,
                exchanges: vec!["primary.b.example".to_string()],
            },
            MxEntry {
                preference: 10,
                exchanges: vec!["backup.b.example".to_string()],
            },
        ];
        let hosts = mx.to_remote_hosts("b.example", 5).unwrap();
        assert_eq!(hosts[0].hostname(), "primary.b.example");
        assert_eq!(hosts[1].hostname(), "backup.b.example");
    }
}
