/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use tokio::sync::mpsc;

use crate::{core::SMTP, queue::now};

use super::{tls::TlsAggregate, Event};

/// Collects per-attempt TLS results and flushes one aggregate report per
/// policy domain when the reporting window closes.
pub struct Scheduler {
    core: Arc<SMTP>,
    rx: mpsc::Receiver<Event>,
    aggregates: AHashMap<String, TlsAggregate>,
    window_start: u64,
}

impl Scheduler {
    pub fn new(core: Arc<SMTP>, rx: mpsc::Receiver<Event>) -> Self {
        Scheduler {
            core,
            rx,
            aggregates: AHashMap::new(),
            window_start: now(),
        }
    }

    pub async fn run(&mut self) {
        let interval = self.core.core.report.tls_interval;
        loop {
            let deadline = self
                .window_start
                .saturating_add(interval.as_secs())
                .saturating_sub(now());
            match tokio::time::timeout(Duration::from_secs(deadline.max(1)), self.rx.recv()).await
            {
                Ok(Some(Event::Tls(event))) => {
                    tracing::debug!(
                        context = "report",
                        event = "tls-result",
                        domain = event.domain.as_str(),
                        failure = event.failure.is_some());
                    self.aggregates
                        .entry(event.domain.clone())
                        .or_default()
                        .record(*event);
                }
                Ok(Some(Event::Stop)) | Ok(None) => {
                    self.flush().await;
                    break;
                }
                Err(_) => {
                    self.flush().await;
                    self.window_start = now();
                }
            }
        }

        tracing::info!(
            context = "report",
            event = "stop",
            "Report scheduler stopped.");
    }

    async fn flush(&mut self) {
        for (domain, aggregate) in std::mem::take(&mut self.aggregates) {
            if !aggregate.rua.is_empty() {
                self.core
                    .send_tls_report(domain, aggregate, self.window_start)
                    .await;
            }
        }
    }
}
