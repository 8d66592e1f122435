/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::core::SMTP;

use super::{
    now, spool, DeliveryAttempt, Event, Message, OnHold, QueueId, QueueRequest, Schedule, Status,
    WorkerResult,
};

/// Queue refresh interval when no event is due sooner.
const QUEUE_REFRESH: Duration = Duration::from_secs(5 * 60);
const CLEANUP_INTERVAL: u64 = 10 * 60;

/// The single scheduler task. All mutations of queued entries, including
/// administrative ones, pass through this loop; a message is therefore
/// visible to at most one delivery worker at a time.
pub struct Queue {
    pub core: Arc<SMTP>,
    pub scheduled: Vec<Schedule<Box<Message>>>,
    pub on_hold: Vec<OnHold<Box<Message>>>,
    pub in_flight: usize,
    pub rx: mpsc::Receiver<Event>,
}

impl Queue {
    pub fn new(core: Arc<SMTP>, rx: mpsc::Receiver<Event>) -> Self {
        Queue {
            core,
            scheduled: Vec::with_capacity(128),
            on_hold: Vec::new(),
            in_flight: 0,
            rx,
        }
    }

    pub async fn run(&mut self) {
        // Restore the spool left over from the previous run.
        for message in spool::read_queue(&self.core.core.queue).await {
            tracing::info!(
                context = "queue",
                event = "restored",
                id = message.id,
                "Restored queued message from spool.");
            self.scheduled.push(Schedule {
                due: message.next_event().unwrap_or_else(now),
                inner: message,
            });
        }

        let mut next_cleanup = now() + CLEANUP_INTERVAL;
        loop {
            let wake_after = self
                .next_wake_up()
                .unwrap_or(QUEUE_REFRESH);

            let event = tokio::time::timeout(wake_after, self.rx.recv()).await;
            match event {
                Ok(Some(Event::Queue(schedule))) => {
                    self.scheduled.push(schedule);
                }
                Ok(Some(Event::Done(result))) => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    match result {
                        WorkerResult::Done => (),
                        WorkerResult::Retry(schedule) => self.scheduled.push(schedule),
                        WorkerResult::OnHold(on_hold) => self.on_hold.push(on_hold),
                    }
                }
                Ok(Some(Event::Manage(request))) => self.handle_manage(request).await,
                Ok(Some(Event::Stop)) | Ok(None) => break,
                Err(_) => (),
            }

            // Re-admit parked messages once a limiter slot freed up or their
            // fallback due time arrived.
            let now_ts = now();
            let mut idx = 0;
            while idx < self.on_hold.len() {
                let release = {
                    let entry = &self.on_hold[idx];
                    entry
                        .limiters
                        .iter()
                        .any(|limiter| limiter.check_is_allowed())
                        || entry.next_due.map_or(false, |due| due <= now_ts)
                };
                if release {
                    let entry = self.on_hold.swap_remove(idx);
                    self.scheduled.push(Schedule {
                        due: entry.next_due.unwrap_or(now_ts),
                        inner: entry.message,
                    });
                } else {
                    idx += 1;
                }
            }

            // Dispatch everything that is due, unless shutting down.
            if !self.core.inner.shutdown.is_shutdown() {
                let max_threads = self.core.core.queue.max_threads;
                let mut idx = 0;
                while idx < self.scheduled.len() {
                    if self.in_flight >= max_threads {
                        break;
                    }
                    if self.scheduled[idx].due <= now_ts {
                        let schedule = self.scheduled.swap_remove(idx);
                        self.in_flight += 1;
                        DeliveryAttempt::from(schedule.inner)
                            .try_deliver(self.core.clone());
                    } else {
                        idx += 1;
                    }
                }
            } else if self.in_flight == 0 {
                break;
            }

            if now_ts >= next_cleanup {
                next_cleanup = now_ts + CLEANUP_INTERVAL;
                self.core.queue.throttle.cleanup();
                self.core.ip_limits.cleanup();
            }
        }

        tracing::info!(
            context = "queue",
            event = "stop",
            "Queue manager stopped.");
    }

    fn next_wake_up(&self) -> Option<Duration> {
        // With all workers busy, or during shutdown, only events matter.
        if self.in_flight >= self.core.core.queue.max_threads
            || self.core.inner.shutdown.is_shutdown()
        {
            return None;
        }
        self.scheduled
            .iter()
            .map(|schedule| schedule.due)
            .chain(self.on_hold.iter().filter_map(|entry| entry.next_due))
            .min()
            .map(|due| Duration::from_secs(due.saturating_sub(now())))
    }

    async fn handle_manage(&mut self, request: QueueRequest) {
        match request {
            QueueRequest::List { result_tx } => {
                let mut ids = self
                    .scheduled
                    .iter()
                    .map(|schedule| schedule.inner.id)
                    .chain(self.on_hold.iter().map(|entry| entry.message.id))
                    .collect::<Vec<_>>();
                ids.sort_unstable();
                let _ = result_tx.send(ids);
            }
            QueueRequest::Kick { id, result_tx } => {
                let _ = result_tx.send(self.kick(id));
            }
            QueueRequest::Drop { id, result_tx } => {
                let _ = result_tx.send(self.drop_entry(id).await);
            }
            QueueRequest::Save {
                id,
                due,
                transport,
                result_tx,
            } => {
                let found = if let Some(message) = self.find_mut(id) {
                    if let Some(transport) = transport {
                        message.transport = Some(transport);
                    }
                    if let Some(due) = due {
                        for domain in &mut message.domains {
                            if matches!(
                                domain.status,
                                Status::Scheduled | Status::TemporaryFailure(_)
                            ) {
                                domain.retry.due = due;
                            }
                        }
                    }
                    message.save_changes().await;
                    true
                } else {
                    false
                };
                if found {
                    self.reschedule(id);
                }
                let _ = result_tx.send(found);
            }
        }
    }

    fn kick(&mut self, id: QueueId) -> bool {
        let now_ts = now();
        if let Some(idx) = self.on_hold.iter().position(|entry| entry.message.id == id) {
            let entry = self.on_hold.swap_remove(idx);
            self.scheduled.push(Schedule {
                due: now_ts,
                inner: entry.message,
            });
        }
        if let Some(schedule) = self
            .scheduled
            .iter_mut()
            .find(|schedule| schedule.inner.id == id)
        {
            schedule.due = now_ts;
            for domain in &mut schedule.inner.domains {
                if matches!(
                    domain.status,
                    Status::Scheduled | Status::TemporaryFailure(_)
                ) {
                    domain.retry.due = now_ts;
                }
            }
            true
        } else {
            false
        }
    }

    async fn drop_entry(&mut self, id: QueueId) -> bool {
        if let Some(idx) = self
            .scheduled
            .iter()
            .position(|schedule| schedule.inner.id == id)
        {
            let schedule = self.scheduled.swap_remove(idx);
            schedule.inner.remove().await;
            true
        } else if let Some(idx) = self.on_hold.iter().position(|entry| entry.message.id == id) {
            let entry = self.on_hold.swap_remove(idx);
            entry.message.remove().await;
            true
        } else {
            false
        }
    }

    fn find_mut(&mut self, id: QueueId) -> Option<&mut Message> {
        self.scheduled
            .iter_mut()
            .map(|schedule| schedule.inner.as_mut())
            .chain(self.on_hold.iter_mut().map(|entry| entry.message.as_mut()))
            .find(|message| message.id == id)
    }

    fn reschedule(&mut self, id: QueueId) {
        if let Some(schedule) = self
            .scheduled
            .iter_mut()
            .find(|schedule| schedule.inner.id == id)
        {
            schedule.due = schedule.inner.next_event().unwrap_or_else(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use common::{
        config::{MailAuthConfig, QueueConfig, ReportConfig, SessionConfig},
        resolver::{DnsResolver, MockResolver},
        store::{MemoryAccounts, MemoryStore},
        Core, Inner,
    };
    use tokio::sync::oneshot;

    use crate::{
        core::SMTP,
        queue::{Domain, Message, Recipient, Status},
    };

    use super::*;

    fn test_queue() -> (Queue, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "maild-test-manager-{}-{}",
            std::process::id(),
            now()
        ));
        std::fs::create_dir_all(&path).unwrap();
        let core = Arc::new(Core {
            hostname: "mx.local.example".to_string(),
            session: SessionConfig::default(),
            queue: QueueConfig {
                path: path.clone(),
                ..QueueConfig::default()
            },
            mail_auth: MailAuthConfig::default(),
            report: ReportConfig::default(),
            resolver: DnsResolver::mock(MockResolver::new()),
            psl: auth::suffixlist::PublicSuffix::parse(""),
            store: Arc::new(MemoryStore::new()),
            accounts: Arc::new(MemoryAccounts::default()),
        });
        let (core, queue_rx, _report_rx) = SMTP::new(core, Arc::new(Inner::new()));
        (Queue::new(core, queue_rx), path)
    }

    fn queued_message(id: QueueId, spool_dir: &PathBuf) -> Box<Message> {
        let path = spool_dir.join(format!("{id:016x}_{:08x}.msg", 4));
        std::fs::write(&path, b"test").unwrap();
        Box::new(Message {
            id,
            created: now(),
            path,
            return_path: "alice@a.example".to_string(),
            return_path_lcase: "alice@a.example".to_string(),
            return_path_domain: "a.example".to_string(),
            recipients: vec![Recipient {
                domain_idx: 0,
                address: "bob@b.example".to_string(),
                address_lcase: "bob@b.example".to_string(),
                status: Status::Scheduled,
                flags: 0,
                orcpt: None,
            }],
            domains: vec![Domain {
                domain: "b.example".to_string(),
                retry: Schedule {
                    due: now() + 3600,
                    inner: 1,
                },
                notify: Schedule {
                    due: now() + 86400,
                    inner: 0,
                },
                expires: now() + 5 * 86400,
                status: Status::Scheduled,
                changed: false,
            }],
            flags: 0,
            env_id: None,
            priority: 0,
            transport: None,
            size: 4,
            quota_refs: Vec::new(),
        })
    }

    #[tokio::test]
    async fn kick_drop_and_save_operate_on_scheduled_entries() {
        let (mut queue, spool_dir) = test_queue();
        for id in [1u64, 2] {
            let message = queued_message(id, &spool_dir);
            queue.scheduled.push(Schedule {
                due: message.next_event().unwrap(),
                inner: message,
            });
        }

        let (tx, rx) = oneshot::channel();
        queue
            .handle_manage(QueueRequest::List { result_tx: tx })
            .await;
        assert_eq!(rx.await.unwrap(), vec![1, 2]);

        // Kick moves the retry schedule to now.
        let (tx, rx) = oneshot::channel();
        queue
            .handle_manage(QueueRequest::Kick {
                id: 1,
                result_tx: tx,
            })
            .await;
        assert!(rx.await.unwrap());
        let entry = queue
            .scheduled
            .iter()
            .find(|schedule| schedule.inner.id == 1)
            .unwrap();
        assert!(entry.due <= now());
        assert!(entry.inner.domains[0].retry.due <= now());

        // Save switches the transport and persists a metadata snapshot.
        let (tx, rx) = oneshot::channel();
        queue
            .handle_manage(QueueRequest::Save {
                id: 2,
                due: Some(now() + 60),
                transport: Some("relay".to_string()),
                result_tx: tx,
            })
            .await;
        assert!(rx.await.unwrap());
        let entry = queue
            .scheduled
            .iter()
            .find(|schedule| schedule.inner.id == 2)
            .unwrap();
        assert_eq!(entry.inner.transport.as_deref(), Some("relay"));
        let spooled = std::fs::read(&entry.inner.path).unwrap();
        assert!(String::from_utf8_lossy(&spooled).contains("relay"));

        // Drop removes the entry and its spool file.
        let path = entry.inner.path.clone();
        let (tx, rx) = oneshot::channel();
        queue
            .handle_manage(QueueRequest::Drop {
                id: 2,
                result_tx: tx,
            })
            .await;
        assert!(rx.await.unwrap());
        assert!(!path.exists());
        assert_eq!(queue.scheduled.len(), 1);

        // Unknown ids are reported as such.
        let (tx, rx) = oneshot::channel();
        queue
            .handle_manage(QueueRequest::Drop {
                id: 99,
                result_tx: tx,
            })
            .await;
        assert!(!rx.await.unwrap());

        let _ = std::fs::remove_dir_all(&spool_dir);
    }
}
