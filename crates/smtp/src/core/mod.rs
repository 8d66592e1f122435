/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::SystemTime,
};

use auth::{iprev::IprevOutput, spf::SpfOutput};
use common::{
    cache::TtlCache,
    config::tls::TlsConnectors,
    listener::{limiter::InFlight, ServerInstance, SessionStream},
    Core, Inner,
};
use smtp_proto::request::receiver::{
    DataReceiver, DummyDataReceiver, DummyLineReceiver, LineReceiver, RequestReceiver,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    inbound::auth::SaslToken,
    outbound::mta_sts::Policy,
    queue::{self, QueueId},
    reporting,
};

pub mod params;
pub mod throttle;

pub use params::SessionParameters;

/// Shared handle of the mail transfer core: configuration snapshot, process
/// state, and the channels into the queue manager and report scheduler.
pub struct SMTP {
    pub core: Arc<Core>,
    pub inner: Arc<Inner>,
    pub queue: QueueCore,
    pub report: ReportCore,
    pub connectors: TlsConnectors,
    pub mta_sts_cache: TtlCache<String, Arc<Policy>>,
    pub known_senders: throttle::KnownSenders,
    pub ip_limits: throttle::IpLimits,
}

pub struct QueueCore {
    pub tx: mpsc::Sender<queue::Event>,
    pub id_seq: AtomicU32,
    pub quota: queue::quota::QuotaLimiter,
    pub throttle: queue::throttle::DomainThrottle,
}

pub struct ReportCore {
    pub tx: mpsc::Sender<reporting::Event>,
}

impl SMTP {
    /// Builds the core; the returned receivers must be handed to
    /// `SpawnServices`.
    pub fn new(
        core: Arc<Core>,
        inner: Arc<Inner>,
    ) -> (
        Arc<SMTP>,
        mpsc::Receiver<queue::Event>,
        mpsc::Receiver<reporting::Event>,
    ) {
        let (queue_tx, queue_rx) = mpsc::channel(1024);
        let (report_tx, report_rx) = mpsc::channel(1024);
        let quota = queue::quota::QuotaLimiter::new(
            core.queue.max_queue_size,
            core.queue.max_queue_messages,
        );
        let throttle =
            queue::throttle::DomainThrottle::new(core.queue.max_concurrent_per_domain);
        (
            Arc::new(SMTP {
                core,
                inner,
                queue: QueueCore {
                    tx: queue_tx,
                    id_seq: AtomicU32::new(0),
                    quota,
                    throttle,
                },
                report: ReportCore { tx: report_tx },
                connectors: TlsConnectors::build(),
                mta_sts_cache: TtlCache::with_capacity(1024),
                known_senders: throttle::KnownSenders::new(),
                ip_limits: throttle::IpLimits::new(),
            }),
            queue_rx,
            report_rx,
        )
    }

    /// Queue ids pack seconds-since-2000 in the low half and a sequence
    /// number in the high half; unique per instance lifetime.
    pub fn queue_id(&self) -> QueueId {
        (SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
            .saturating_sub(946684800)
            & 0xFFFFFFFF)
            | (self.queue.id_seq.fetch_add(1, Ordering::Relaxed) as u64) << 32
    }
}

pub enum State {
    Request(RequestReceiver),
    Data(DataReceiver),
    Sasl(LineReceiver<SaslToken>),
    DataTooLarge(DummyDataReceiver),
    RequestTooLarge(DummyLineReceiver),
    Accepted(QueueId),
    None,
}

impl Default for State {
    fn default() -> Self {
        State::Request(RequestReceiver::default())
    }
}

pub struct Session<T: SessionStream> {
    pub core: Arc<SMTP>,
    pub instance: Arc<ServerInstance>,
    pub stream: T,
    pub span: tracing::Span,
    pub state: State,
    pub data: SessionData,
    pub params: SessionParameters,
    pub in_flight: Vec<InFlight>,
}

pub struct SessionData {
    pub session_id: u64,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub helo_domain: String,
    pub authenticated_as: String,
    pub authenticated_emails: Vec<String>,
    pub mail_from: Option<SessionAddress>,
    pub rcpt_to: Vec<SessionAddress>,
    pub message: Vec<u8>,
    pub declared_size: usize,
    pub spf_ehlo: Option<SpfOutput>,
    pub spf_mail_from: Option<SpfOutput>,
    pub iprev: Option<IprevOutput>,
    pub messages_sent: usize,
    pub auth_failures: u32,
    pub bad_commands: u32,
}

impl SessionData {
    pub fn new(local_ip: IpAddr, local_port: u16, remote_ip: IpAddr, remote_port: u16, session_id: u64) -> Self {
        SessionData {
            session_id,
            remote_ip,
            remote_port,
            local_ip,
            local_port,
            helo_domain: String::new(),
            authenticated_as: String::new(),
            authenticated_emails: Vec::new(),
            mail_from: None,
            rcpt_to: Vec::new(),
            message: Vec::new(),
            declared_size: 0,
            spf_ehlo: None,
            spf_mail_from: None,
            iprev: None,
            messages_sent: 0,
            auth_failures: 0,
            bad_commands: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionAddress {
    pub address: String,
    pub address_lcase: String,
    pub domain: String,
    pub flags: u64,
    pub dsn_info: Option<String>,
}

impl SessionAddress {
    pub fn new(address: String) -> Self {
        let address_lcase = address.to_lowercase();
        let domain = address_lcase
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();
        SessionAddress {
            address,
            address_lcase,
            domain,
            flags: 0,
            dsn_info: None,
        }
    }
}

impl<T: SessionStream> Session<T> {
    pub fn reset(&mut self) {
        self.data.mail_from = None;
        self.data.spf_mail_from = None;
        self.data.rcpt_to.clear();
        self.data.message = Vec::with_capacity(0);
    }

    #[inline(always)]
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ()> {
        let err = match self.stream.write_all(bytes).await {
            Ok(_) => match self.stream.flush().await {
                Ok(_) => {
                    tracing::trace!(parent: &self.span,
                        event = "write",
                        data = std::str::from_utf8(bytes).unwrap_or_default(),
                        size = bytes.len());
                    return Ok(());
                }
                Err(err) => err,
            },
            Err(err) => err,
        };
        tracing::debug!(parent: &self.span,
            event = "error",
            "Failed to write to stream: {err}");
        Err(())
    }

    #[inline(always)]
    pub async fn read(&mut self, bytes: &mut [u8]) -> Result<usize, ()> {
        match self.stream.read(bytes).await {
            Ok(len) => {
                tracing::trace!(parent: &self.span,
                    event = "read",
                    data = if matches!(self.state, State::Request(_)) {
                        bytes
                            .get(0..len)
                            .and_then(|bytes| std::str::from_utf8(bytes).ok())
                            .unwrap_or("[invalid UTF8]")
                    } else {
                        "[DATA]"
                    },
                    size = len);
                Ok(len)
            }
            Err(err) => {
                tracing::debug!(parent: &self.span,
                    event = "error",
                    "Failed to read from stream: {err}");
                Err(())
            }
        }
    }
}
