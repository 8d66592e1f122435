/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use common::config::QueueConfig;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::core::SMTP;

use super::{now, Domain, Event, Message, Recipient, Schedule, Status};

impl SMTP {
    /// Spools `message` durably and hands it to the queue manager. The 250
    /// response must not be sent unless this returns true.
    pub async fn queue_message(
        &self,
        mut message: Box<Message>,
        headers: Option<&[u8]>,
        raw_message: &[u8],
        span: &tracing::Span,
    ) -> bool {
        if message.id == 0 {
            message.id = self.queue_id();
        }
        message.size = raw_message.len() + headers.map_or(0, |h| h.len());

        let config = &self.core.queue;
        message.path = message_path(config, message.id, message.size);
        if let Some(parent) = message.path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }

        let metadata = message.serialize();
        let mut file = match fs::File::create(&message.path).await {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(parent: span,
                    context = "queue",
                    event = "error",
                    "Failed to create file {}: {}",
                    message.path.display(),
                    err);
                return false;
            }
        };
        for bytes in [headers.unwrap_or_default(), raw_message, &metadata] {
            if !bytes.is_empty() {
                if let Err(err) = file.write_all(bytes).await {
                    tracing::error!(parent: span,
                        context = "queue",
                        event = "error",
                        "Failed to write to file {}: {}",
                        message.path.display(),
                        err);
                    return false;
                }
            }
        }
        if let Err(err) = file.sync_all().await {
            tracing::error!(parent: span,
                context = "queue",
                event = "error",
                "Failed to sync file {}: {}",
                message.path.display(),
                err);
            return false;
        }

        tracing::info!(parent: span,
            context = "queue",
            event = "scheduled",
            id = message.id,
            from = if !message.return_path.is_empty() {
                message.return_path.as_str()
            } else {
                "<>"
            },
            nrcpts = message.recipients.len(),
            size = message.size,
            "Message queued for delivery.");

        let due = message.next_event().unwrap_or_else(now);
        if self
            .queue
            .tx
            .send(Event::Queue(Schedule {
                due,
                inner: message,
            }))
            .await
            .is_err()
        {
            tracing::warn!(parent: span,
                context = "queue",
                event = "error",
                "Queue channel closed: message queued but won't be sent until next restart.");
        }
        true
    }

    pub fn new_message(
        &self,
        return_path: impl Into<String>,
        transport: Option<String>,
    ) -> Box<Message> {
        let return_path = return_path.into();
        let return_path_lcase = return_path.to_lowercase();
        let return_path_domain = return_path_lcase
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();
        Box::new(Message {
            id: 0,
            created: now(),
            path: PathBuf::new(),
            return_path,
            return_path_lcase,
            return_path_domain,
            recipients: Vec::with_capacity(1),
            domains: Vec::with_capacity(1),
            flags: 0,
            env_id: None,
            priority: 0,
            transport,
            size: 0,
            quota_refs: Vec::new(),
        })
    }
}

impl Message {
    pub fn add_recipient(&mut self, rcpt: impl Into<String>, config: &QueueConfig) {
        let rcpt = rcpt.into();
        let rcpt_lcase = rcpt.to_lowercase();
        let rcpt_domain = rcpt_lcase
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();
        self.add_recipient_parts(rcpt, rcpt_lcase, rcpt_domain, 0, None, config);
    }

    pub fn add_recipient_parts(
        &mut self,
        rcpt: impl Into<String>,
        rcpt_lcase: impl Into<String>,
        rcpt_domain: impl Into<String>,
        flags: u64,
        orcpt: Option<String>,
        config: &QueueConfig,
    ) {
        let rcpt_domain = rcpt_domain.into();
        let domain_idx = if let Some(idx) = self
            .domains
            .iter()
            .position(|d| d.domain == rcpt_domain)
        {
            idx
        } else {
            let idx = self.domains.len();
            self.domains.push(Domain {
                domain: rcpt_domain,
                retry: Schedule::now(),
                notify: Schedule::later(
                    config
                        .notify
                        .first()
                        .copied()
                        .unwrap_or(config.expire),
                ),
                expires: now() + config.expire.as_secs(),
                status: Status::Scheduled,
                changed: false,
            });
            idx
        };
        self.recipients.push(Recipient {
            domain_idx,
            address: rcpt.into(),
            address_lcase: rcpt_lcase.into(),
            status: Status::Scheduled,
            flags,
            orcpt,
        });
    }

    /// Appends the current metadata snapshot after in-place status changes.
    pub async fn save_changes(&mut self) {
        for domain in &mut self.domains {
            domain.changed = false;
        }
        let buf = self.serialize();
        let err = match OpenOptions::new().append(true).open(&self.path).await {
            Ok(mut file) => match file.write_all(&buf).await {
                Ok(_) => return,
                Err(err) => err,
            },
            Err(err) => err,
        };
        tracing::error!(
            context = "queue",
            event = "error",
            "Failed to write to {}: {}",
            self.path.display(),
            err);
    }

    pub async fn remove(&self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            tracing::error!(
                context = "queue",
                event = "error",
                "Failed to delete queued message {}: {}",
                self.path.display(),
                err);
        }
    }

    /// Reads the full spooled message body, excluding the metadata trailer.
    pub async fn read_spooled_message(&self) -> Result<Vec<u8>, String> {
        let mut buf = vec![0u8; self.size];
        let mut file = fs::File::open(&self.path)
            .await
            .map_err(|err| format!("Failed to open {}: {err}", self.path.display()))?;
        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]).await {
                Ok(0) => {
                    return Err(format!(
                        "Queued message {} truncated at {read} bytes",
                        self.path.display()
                    ))
                }
                Ok(len) => read += len,
                Err(err) => {
                    return Err(format!("Failed to read {}: {err}", self.path.display()))
                }
            }
        }
        Ok(buf)
    }

    /// Reads up to the first `limit` bytes of the spooled message, truncated
    /// at a header boundary; used for DSN attachments.
    pub async fn read_message_headers(&self, limit: usize) -> Vec<u8> {
        let mut buf = vec![0u8; self.size.min(limit)];
        match fs::File::open(&self.path).await {
            Ok(mut file) => {
                let mut read = 0;
                while read < buf.len() {
                    match file.read(&mut buf[read..]).await {
                        Ok(0) => break,
                        Ok(len) => read += len,
                        Err(_) => break,
                    }
                }
                buf.truncate(read);
                // Cut at the last complete header line.
                if let Some(pos) = buf.iter().rposition(|&b| b == b'\n') {
                    buf.truncate(pos + 1);
                }
                buf
            }
            Err(err) => {
                tracing::error!(
                    context = "queue",
                    event = "error",
                    "Failed to open queued message {}: {}",
                    self.path.display(),
                    err);
                Vec::new()
            }
        }
    }

    pub async fn from_path(path: PathBuf) -> Result<Message, String> {
        let filename = path
            .file_stem()
            .and_then(|f| f.to_str())
            .ok_or_else(|| format!("Invalid queue file name {}", path.display()))?;
        let (id, size) = filename
            .split_once('_')
            .and_then(|(id, size)| {
                Some((
                    u64::from_str_radix(id, 16).ok()?,
                    usize::from_str_radix(size, 16).ok()?,
                ))
            })
            .ok_or_else(|| format!("Invalid queue file name {}", path.display()))?;

        let file_size = fs::metadata(&path)
            .await
            .map_err(|err| format!("Failed to read metadata of {}: {err}", path.display()))?
            .len() as usize;
        if size == 0 || size >= file_size {
            return Err(format!(
                "Invalid queue file size {size} for {}",
                path.display()
            ));
        }

        let mut file = fs::File::open(&path)
            .await
            .map_err(|err| format!("Failed to open {}: {err}", path.display()))?;
        file.seek(std::io::SeekFrom::Start(size as u64))
            .await
            .map_err(|err| format!("Failed to seek {}: {err}", path.display()))?;
        let mut buf = Vec::with_capacity(file_size - size);
        file.read_to_end(&mut buf)
            .await
            .map_err(|err| format!("Failed to read {}: {err}", path.display()))?;

        Message::deserialize(&buf, id, size, path.clone())
            .ok_or_else(|| format!("Failed to deserialize metadata of {}", path.display()))
    }
}

fn message_path(config: &common::config::QueueConfig, id: u64, size: usize) -> PathBuf {
    let mut path = config.path.clone();
    if config.hash > 0 {
        path.push((id % config.hash).to_string());
    }
    path.push(format!("{id:016x}_{size:08x}.msg"));
    path
}

/// Scans the spool directory on startup, restoring pending messages.
pub async fn read_queue(config: &common::config::QueueConfig) -> Vec<Box<Message>> {
    let mut messages = Vec::new();
    let mut dirs = vec![config.path.clone()];
    while let Some(dir) = dirs.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if entry.file_type().await.map_or(false, |t| t.is_dir()) {
                dirs.push(path);
            } else if path.extension().map_or(false, |e| e == "msg") {
                match Message::from_path(path).await {
                    Ok(message) => messages.push(Box::new(message)),
                    Err(err) => {
                        tracing::error!(
                            context = "queue",
                            event = "error",
                            "Queue startup scan: {err}");
                    }
                }
            }
        }
    }
    messages
}
