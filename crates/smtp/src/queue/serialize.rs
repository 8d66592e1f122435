/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{Domain, Error, ErrorDetails, HostResponse, Message, Recipient, Schedule, Status};

/// Queue metadata persisted after the message blob. Every state change
/// appends a fresh snapshot line; the last parseable line wins, so a crash
/// mid-append loses at most the latest status update.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageMeta {
    pub created: u64,
    pub return_path: String,
    pub env_id: Option<String>,
    pub flags: u64,
    pub priority: i16,
    pub transport: Option<String>,
    pub domains: Vec<DomainMeta>,
    pub recipients: Vec<RecipientMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DomainMeta {
    pub domain: String,
    pub retry: Schedule<u32>,
    pub notify: Schedule<u32>,
    pub expires: u64,
    pub status: Status<(), Error>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecipientMeta {
    pub domain_idx: usize,
    pub address: String,
    pub orcpt: Option<String>,
    pub flags: u64,
    pub status: Status<HostResponse<String>, HostResponse<ErrorDetails>>,
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        let meta = MessageMeta {
            created: self.created,
            return_path: self.return_path.clone(),
            env_id: self.env_id.clone(),
            flags: self.flags,
            priority: self.priority,
            transport: self.transport.clone(),
            domains: self
                .domains
                .iter()
                .map(|domain| DomainMeta {
                    domain: domain.domain.clone(),
                    retry: domain.retry.clone(),
                    notify: domain.notify.clone(),
                    expires: domain.expires,
                    status: domain.status.clone(),
                })
                .collect(),
            recipients: self
                .recipients
                .iter()
                .map(|rcpt| RecipientMeta {
                    domain_idx: rcpt.domain_idx,
                    address: rcpt.address.clone(),
                    orcpt: rcpt.orcpt.clone(),
                    flags: rcpt.flags,
                    status: rcpt.status.clone(),
                })
                .collect(),
        };
        let mut bytes = serde_json::to_vec(&meta).unwrap_or_default();
        bytes.push(b'\n');
        bytes
    }

    pub fn deserialize(bytes: &[u8], id: u64, size: usize, path: PathBuf) -> Option<Message> {
        let meta = bytes
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .rev()
            .find_map(|line| serde_json::from_slice::<MessageMeta>(line).ok())?;

        let return_path_lcase = meta.return_path.to_lowercase();
        let return_path_domain = return_path_lcase
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_default();
        Some(Message {
            id,
            created: meta.created,
            path,
            return_path: meta.return_path,
            return_path_lcase,
            return_path_domain,
            domains: meta
                .domains
                .into_iter()
                .map(|domain| Domain {
                    domain: domain.domain,
                    retry: domain.retry,
                    notify: domain.notify,
                    expires: domain.expires,
                    status: domain.status,
                    changed: false,
                })
                .collect(),
            recipients: meta
                .recipients
                .into_iter()
                .map(|rcpt| Recipient {
                    domain_idx: rcpt.domain_idx,
                    address_lcase: rcpt.address.to_lowercase(),
                    address: rcpt.address,
                    orcpt: rcpt.orcpt,
                    flags: rcpt.flags,
                    status: rcpt.status,
                })
                .collect(),
            flags: meta.flags,
            env_id: meta.env_id,
            priority: meta.priority,
            transport: meta.transport,
            size,
            quota_refs: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::queue::now;

    use super::*;

    #[test]
    fn metadata_round_trip_last_snapshot_wins() {
        let mut message = Message {
            id: 42,
            created: now(),
            path: PathBuf::from("/tmp/test.msg"),
            return_path: "Alice@A.example".to_string(),
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
                retry: Schedule { due: 100, inner: 0 },
                notify: Schedule { due: 200, inner: 0 },
                expires: 300,
                status: Status::Scheduled,
                changed: false,
            }],
            flags: 7,
            env_id: Some("envid".to_string()),
            priority: 0,
            transport: Some("relay".to_string()),
            size: 1234,
            quota_refs: Vec::new(),
        };

        let mut buf = message.serialize();
        message.domains[0].status =
            Status::TemporaryFailure(Error::Io("connection reset".to_string()));
        message.domains[0].retry.inner = 3;
        buf.extend_from_slice(&message.serialize());
        // A torn final write is ignored.
        buf.extend_from_slice(b"{\"created\":12");

        let restored =
            Message::deserialize(&buf, 42, 1234, PathBuf::from("/tmp/test.msg")).unwrap();
        assert_eq!(restored.id, 42);
        assert_eq!(restored.size, 1234);
        assert_eq!(restored.return_path_lcase, "alice@a.example");
        assert_eq!(restored.transport.as_deref(), Some("relay"));
        assert_eq!(restored.domains[0].retry.inner, 3);
        assert_eq!(
            restored.domains[0].status,
            Status::TemporaryFailure(Error::Io("connection reset".to_string()))
        );
        assert_eq!(restored.recipients[0].address_lcase, "bob@b.example");
    }
}
