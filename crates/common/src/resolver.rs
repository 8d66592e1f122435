/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use auth::dane::{Tlsa, TlsaEntry};
pub use auth::{DnsError, MxEntry};
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::rr::rdata::tlsa::{CertUsage, Matching, Selector},
    Name, TokioAsyncResolver,
};

use crate::cache::TtlCache;

/// Typed answer plus whether the whole response validated up to a DNSSEC
/// trust anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecords<T> {
    pub records: Vec<T>,
    pub authentic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpLookupStrategy {
    Ipv4Only,
    Ipv6Only,
    Ipv4thenIpv6,
    Ipv6thenIpv4,
}

pub struct DnsResolver {
    backend: Backend,
    cache_ipv4: TtlCache<String, Arc<DnsRecords<Ipv4Addr>>>,
    cache_ipv6: TtlCache<String, Arc<DnsRecords<Ipv6Addr>>>,
    cache_mx: TtlCache<String, Arc<DnsRecords<MxEntry>>>,
    cache_ptr: TtlCache<String, Arc<Vec<String>>>,
    cache_tlsa: TtlCache<String, Option<Arc<Tlsa>>>,
}

enum Backend {
    System(Box<TokioAsyncResolver>),
    Mock(MockResolver),
}

const CACHE_CAPACITY: usize = 1024;
const NEGATIVE_TLSA_TTL: Duration = Duration::from_secs(300);

impl DnsResolver {
    pub fn system_conf() -> Result<Self, String> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|err| format!("Failed to read system DNS configuration: {err}"))?;
        opts.validate = true;
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        Ok(Self::with_backend(Backend::System(Box::new(
            TokioAsyncResolver::tokio(config, opts),
        ))))
    }

    pub fn cloudflare() -> Self {
        let mut opts = ResolverOpts::default();
        opts.validate = true;
        Self::with_backend(Backend::System(Box::new(TokioAsyncResolver::tokio(
            ResolverConfig::cloudflare(),
            opts,
        ))))
    }

    pub fn mock(mock: MockResolver) -> Self {
        Self::with_backend(Backend::Mock(mock))
    }

    fn with_backend(backend: Backend) -> Self {
        DnsResolver {
            backend,
            cache_ipv4: TtlCache::with_capacity(CACHE_CAPACITY),
            cache_ipv6: TtlCache::with_capacity(CACHE_CAPACITY),
            cache_mx: TtlCache::with_capacity(CACHE_CAPACITY),
            cache_ptr: TtlCache::with_capacity(CACHE_CAPACITY),
            cache_tlsa: TtlCache::with_capacity(CACHE_CAPACITY),
        }
    }

    pub async fn ipv4_lookup(&self, name: &str) -> Result<Arc<DnsRecords<Ipv4Addr>>, DnsError> {
        let key = fqdn(name);
        if let Some(value) = self.cache_ipv4.get(key.as_str()) {
            return Ok(value);
        }
        match &self.backend {
            Backend::System(resolver) => {
                let lookup = resolver
                    .ipv4_lookup(parse_name(&key)?)
                    .await
                    .map_err(into_dns_error)?;
                let authentic = is_authentic(lookup.as_lookup());
                let records = lookup.iter().map(|a| a.0).collect::<Vec<_>>();
                let valid_until = lookup.as_lookup().valid_until();
                Ok(self.cache_ipv4.insert(
                    key,
                    Arc::new(DnsRecords { records, authentic }),
                    valid_until,
                ))
            }
            Backend::Mock(mock) => {
                let entry = mock.records(&mock.ipv4, &key)?;
                Ok(self
                    .cache_ipv4
                    .insert_ttl(key, Arc::new(entry), mock.ttl))
            }
        }
    }

    pub async fn ipv6_lookup(&self, name: &str) -> Result<Arc<DnsRecords<Ipv6Addr>>, DnsError> {
        let key = fqdn(name);
        if let Some(value) = self.cache_ipv6.get(key.as_str()) {
            return Ok(value);
        }
        match &self.backend {
            Backend::System(resolver) => {
                let lookup = resolver
                    .ipv6_lookup(parse_name(&key)?)
                    .await
                    .map_err(into_dns_error)?;
                let authentic = is_authentic(lookup.as_lookup());
                let records = lookup.iter().map(|a| a.0).collect::<Vec<_>>();
                let valid_until = lookup.as_lookup().valid_until();
                Ok(self.cache_ipv6.insert(
                    key,
                    Arc::new(DnsRecords { records, authentic }),
                    valid_until,
                ))
            }
            Backend::Mock(mock) => {
                let entry = mock.records(&mock.ipv6, &key)?;
                Ok(self
                    .cache_ipv6
                    .insert_ttl(key, Arc::new(entry), mock.ttl))
            }
        }
    }

    /// Combined A/AAAA lookup in the configured preference order. The
    /// `authentic` flag is true only when every consulted answer validated.
    pub async fn ip_lookup(
        &self,
        name: &str,
        strategy: IpLookupStrategy,
        max_results: usize,
    ) -> Result<DnsRecords<IpAddr>, DnsError> {
        let (lookup_v4, lookup_v6, v4_first) = match strategy {
            IpLookupStrategy::Ipv4Only => (true, false, true),
            IpLookupStrategy::Ipv6Only => (false, true, false),
            IpLookupStrategy::Ipv4thenIpv6 => (true, true, true),
            IpLookupStrategy::Ipv6thenIpv4 => (true, true, false),
        };

        let ipv4 = if lookup_v4 {
            match self.ipv4_lookup(name).await {
                Ok(records) => records,
                Err(err @ DnsError::Temporary(_) | err @ DnsError::Permanent(_)) => {
                    return Err(err)
                }
                Err(DnsError::NotFound) if lookup_v6 => Arc::new(DnsRecords {
                    records: Vec::new(),
                    authentic: true,
                }),
                Err(err) => return Err(err),
            }
        } else {
            Arc::new(DnsRecords {
                records: Vec::new(),
                authentic: true,
            })
        };
        let ipv6 = if lookup_v6 {
            match self.ipv6_lookup(name).await {
                Ok(records) => records,
                Err(DnsError::NotFound) if !ipv4.records.is_empty() => Arc::new(DnsRecords {
                    records: Vec::new(),
                    authentic: true,
                }),
                Err(err) => return Err(err),
            }
        } else {
            Arc::new(DnsRecords {
                records: Vec::new(),
                authentic: true,
            })
        };

        let (first, second): (Vec<IpAddr>, Vec<IpAddr>) = if v4_first {
            (
                ipv4.records.iter().copied().map(IpAddr::from).collect(),
                ipv6.records.iter().copied().map(IpAddr::from).collect(),
            )
        } else {
            (
                ipv6.records.iter().copied().map(IpAddr::from).collect(),
                ipv4.records.iter().copied().map(IpAddr::from).collect(),
            )
        };
        let records = first
            .into_iter()
            .chain(second)
            .take(max_results)
            .collect::<Vec<_>>();
        if !records.is_empty() {
            Ok(DnsRecords {
                records,
                authentic: ipv4.authentic && ipv6.authentic,
            })
        } else {
            Err(DnsError::NotFound)
        }
    }

    /// MX lookup with records grouped by preference, best preference first.
    /// An empty exchange list is returned as `NotFound`; the implicit-MX
    /// fallback is the caller's concern.
    pub async fn mx_lookup(&self, name: &str) -> Result<Arc<DnsRecords<MxEntry>>, DnsError> {
        let key = fqdn(name);
        if let Some(value) = self.cache_mx.get(key.as_str()) {
            return Ok(value);
        }
        match &self.backend {
            Backend::System(resolver) => {
                let lookup = resolver
                    .mx_lookup(parse_name(&key)?)
                    .await
                    .map_err(into_dns_error)?;
                let authentic = is_authentic(lookup.as_lookup());
                let mut grouped: Vec<MxEntry> = Vec::new();
                let mut pairs = lookup
                    .iter()
                    .map(|mx| {
                        (
                            mx.preference(),
                            mx.exchange().to_lowercase().to_string(),
                        )
                    })
                    .collect::<Vec<_>>();
                pairs.sort();
                for (preference, exchange) in pairs {
                    match grouped.last_mut() {
                        Some(entry) if entry.preference == preference => {
                            entry.exchanges.push(exchange);
                        }
                        _ => grouped.push(MxEntry {
                            preference,
                            exchanges: vec![exchange],
                        }),
                    }
                }
                let valid_until = lookup.as_lookup().valid_until();
                Ok(self.cache_mx.insert(
                    key,
                    Arc::new(DnsRecords {
                        records: grouped,
                        authentic,
                    }),
                    valid_until,
                ))
            }
            Backend::Mock(mock) => {
                let entry = mock.records(&mock.mx, &key)?;
                Ok(self.cache_mx.insert_ttl(key, Arc::new(entry), mock.ttl))
            }
        }
    }

    /// Raw TXT strings at `name`, character-strings of each record joined.
    pub async fn txt_lookup(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let key = fqdn(name);
        match &self.backend {
            Backend::System(resolver) => {
                let lookup = resolver
                    .txt_lookup(parse_name(&key)?)
                    .await
                    .map_err(into_dns_error)?;
                Ok(lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|s| String::from_utf8_lossy(s))
                            .collect::<String>()
                    })
                    .collect())
            }
            Backend::Mock(mock) => mock.records(&mock.txt, &key).map(|r| r.records),
        }
    }

    pub async fn ptr_lookup(&self, addr: IpAddr) -> Result<Arc<Vec<String>>, DnsError> {
        let key = addr.to_string();
        if let Some(value) = self.cache_ptr.get(key.as_str()) {
            return Ok(value);
        }
        match &self.backend {
            Backend::System(resolver) => {
                let lookup = resolver.reverse_lookup(addr).await.map_err(into_dns_error)?;
                let records = lookup
                    .iter()
                    .map(|ptr| {
                        let name = ptr.to_lowercase().to_string();
                        name.strip_suffix('.').map(|s| s.to_string()).unwrap_or(name)
                    })
                    .collect::<Vec<_>>();
                let valid_until = lookup.as_lookup().valid_until();
                Ok(self
                    .cache_ptr
                    .insert(key, Arc::new(records), valid_until))
            }
            Backend::Mock(mock) => {
                let records = mock.records(&mock.ptr, &key)?.records;
                Ok(self.cache_ptr.insert_ttl(key, Arc::new(records), mock.ttl))
            }
        }
    }

    /// TLSA lookup per RFC 7672: only DNSSEC-authentic records are usable,
    /// an insecure answer yields `Ok(None)` so the caller falls back to
    /// opportunistic TLS.
    pub async fn tlsa_lookup(&self, name: &str) -> Result<Option<Arc<Tlsa>>, DnsError> {
        let key = fqdn(name);
        if let Some(value) = self.cache_tlsa.get(key.as_str()) {
            return Ok(value);
        }
        match &self.backend {
            Backend::System(resolver) => {
                let lookup = resolver
                    .tlsa_lookup(parse_name(&key)?)
                    .await
                    .map_err(into_dns_error)?;

                let mut entries = Vec::new();
                let mut has_end_entities = false;
                let mut has_intermediates = false;
                let mut found_insecure = false;
                let valid_until = lookup.as_lookup().valid_until();

                for record in lookup.as_lookup().record_iter() {
                    if let Some(tlsa) = record.data().and_then(|data| data.as_tlsa()) {
                        if !record.proof().is_secure() {
                            found_insecure = true;
                            continue;
                        }
                        let is_end_entity = match tlsa.cert_usage() {
                            CertUsage::DomainIssued => true,
                            CertUsage::TrustAnchor => false,
                            _ => continue,
                        };
                        if is_end_entity {
                            has_end_entities = true;
                        } else {
                            has_intermediates = true;
                        }
                        entries.push(TlsaEntry {
                            is_end_entity,
                            is_sha256: match tlsa.matching() {
                                Matching::Sha256 => true,
                                Matching::Sha512 => false,
                                _ => continue,
                            },
                            is_spki: match tlsa.selector() {
                                Selector::Spki => true,
                                Selector::Full => false,
                                _ => continue,
                            },
                            data: tlsa.cert_data().to_vec(),
                        });
                    }
                }

                let value = if !entries.is_empty() || !found_insecure {
                    Some(Arc::new(Tlsa {
                        entries,
                        has_end_entities,
                        has_intermediates,
                    }))
                } else {
                    None
                };
                Ok(self.cache_tlsa.insert(key, value, valid_until))
            }
            Backend::Mock(mock) => {
                if let Some(err) = mock.errors.get(key.as_str()) {
                    return Err(err.clone());
                }
                let value = mock.tlsa.get(key.as_str()).cloned();
                Ok(self
                    .cache_tlsa
                    .insert(key, value, Instant::now() + NEGATIVE_TLSA_TTL))
            }
        }
    }

    /// DNSBL-style existence probe: does `name` resolve to any A record.
    pub async fn exists_ip(&self, name: &str) -> Result<bool, DnsError> {
        match self.ipv4_lookup(name).await {
            Ok(records) => Ok(!records.records.is_empty()),
            Err(DnsError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl auth::Lookup for DnsResolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.txt_lookup(name).await
    }

    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.ipv4_lookup(name).await.map(|r| r.records.clone())
    }

    async fn ipv6(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.ipv6_lookup(name).await.map(|r| r.records.clone())
    }

    async fn mx(&self, name: &str) -> Result<Vec<MxEntry>, DnsError> {
        self.mx_lookup(name).await.map(|r| r.records.clone())
    }

    async fn ptr(&self, addr: IpAddr) -> Result<Vec<String>, DnsError> {
        self.ptr_lookup(addr).await.map(|r| r.as_ref().clone())
    }
}

fn fqdn(name: &str) -> String {
    let name = name.to_lowercase();
    if name.ends_with('.') {
        name
    } else {
        format!("{name}.")
    }
}

fn parse_name(name: &str) -> Result<Name, DnsError> {
    Name::from_str_relaxed(name).map_err(|err| DnsError::Permanent(err.to_string()))
}

fn into_dns_error(err: hickory_resolver::error::ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
        ResolveErrorKind::Timeout | ResolveErrorKind::Io(_) | ResolveErrorKind::Proto(_) => {
            DnsError::Temporary(err.to_string())
        }
        _ => DnsError::Temporary(err.to_string()),
    }
}

fn is_authentic(lookup: &hickory_resolver::lookup::Lookup) -> bool {
    let mut records = lookup.record_iter().peekable();
    records.peek().is_some() && lookup.record_iter().all(|r| r.proof().is_secure())
}

/// Deterministic resolver for tests, keyed by fully qualified lowercase name.
#[derive(Default)]
pub struct MockResolver {
    pub ttl: Duration,
    txt: AHashMap<String, DnsRecords<String>>,
    ipv4: AHashMap<String, DnsRecords<Ipv4Addr>>,
    ipv6: AHashMap<String, DnsRecords<Ipv6Addr>>,
    mx: AHashMap<String, DnsRecords<MxEntry>>,
    ptr: AHashMap<String, DnsRecords<String>>,
    tlsa: AHashMap<String, Arc<Tlsa>>,
    errors: AHashMap<String, DnsError>,
}

impl MockResolver {
    pub fn new() -> Self {
        MockResolver {
            ttl: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn with_txt(mut self, name: &str, values: impl IntoIterator<Item = &'static str>) -> Self {
        self.txt.insert(
            fqdn(name),
            DnsRecords {
                records: values.into_iter().map(|v| v.to_string()).collect(),
                authentic: false,
            },
        );
        self
    }

    pub fn with_txt_owned(mut self, name: &str, records: Vec<String>) -> Self {
        self.txt.insert(
            fqdn(name),
            DnsRecords {
                records,
                authentic: false,
            },
        );
        self
    }

    pub fn with_ipv4(mut self, name: &str, records: Vec<Ipv4Addr>, authentic: bool) -> Self {
        self.ipv4
            .insert(fqdn(name), DnsRecords { records, authentic });
        self
    }

    pub fn with_ipv6(mut self, name: &str, records: Vec<Ipv6Addr>, authentic: bool) -> Self {
        self.ipv6
            .insert(fqdn(name), DnsRecords { records, authentic });
        self
    }

    pub fn with_mx(mut self, name: &str, records: Vec<MxEntry>, authentic: bool) -> Self {
        self.mx
            .insert(fqdn(name), DnsRecords { records, authentic });
        self
    }

    pub fn with_ptr(mut self, addr: IpAddr, names: impl IntoIterator<Item = &'static str>) -> Self {
        self.ptr.insert(
            addr.to_string(),
            DnsRecords {
                records: names.into_iter().map(|v| v.to_string()).collect(),
                authentic: false,
            },
        );
        self
    }

    pub fn with_tlsa(mut self, name: &str, tlsa: Tlsa) -> Self {
        self.tlsa.insert(fqdn(name), Arc::new(tlsa));
        self
    }

    pub fn with_error(mut self, name: &str, error: DnsError) -> Self {
        self.errors.insert(fqdn(name), error);
        self
    }

    fn records<T: Clone>(
        &self,
        map: &AHashMap<String, DnsRecords<T>>,
        key: &str,
    ) -> Result<DnsRecords<T>, DnsError> {
        if let Some(err) = self.errors.get(key) {
            return Err(err.clone());
        }
        map.get(key).cloned().ok_or(DnsError::NotFound)
    }
}
