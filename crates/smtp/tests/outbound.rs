/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{path::PathBuf, time::Duration};

use smtp::{
    outbound::{client::SmtpClient, session::DeliveryParams},
    queue::{now, Domain, Message, Recipient, Schedule, Status},
};
use smtp_proto::{EhloResponse, EXT_DSN, EXT_SIZE, RCPT_NOTIFY_DELAY, RCPT_NOTIFY_FAILURE};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

/// Scripted remote peer: accepts the first recipient, rejects the second
/// permanently, accepts the message for the rest.
async fn fake_remote(mut stream: DuplexStream, log: tokio::sync::mpsc::Sender<String>) {
    let mut buf = vec![0u8; 4096];
    let mut pending = Vec::new();
    let mut in_data = false;
    loop {
        let Ok(read) = stream.read(&mut buf).await else {
            return;
        };
        if read == 0 {
            return;
        }
        pending.extend_from_slice(&buf[..read]);

        while let Some(pos) = pending.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&pending[..pos]).into_owned();
            pending.drain(..pos + 2);
            let _ = log.send(line.clone()).await;

            if in_data {
                if line == "." {
                    in_data = false;
                    let _ = stream.write_all(b"250 2.0.0 Message accepted\r\n").await;
                }
                continue;
            }
            let reply: &[u8] = if line.starts_with("MAIL FROM") {
                b"250 2.1.0 OK\r\n"
            } else if line.starts_with("RCPT TO:<bob@") {
                b"250 2.1.5 OK\r\n"
            } else if line.starts_with("RCPT TO:") {
                b"550 5.1.1 No such user\r\n"
            } else if line == "DATA" {
                in_data = true;
                b"354 Go ahead\r\n"
            } else if line == "QUIT" {
                let _ = stream.write_all(b"221 Bye\r\n").await;
                return;
            } else {
                b"250 OK\r\n"
            };
            let _ = stream.write_all(reply).await;
        }
    }
}

fn test_message(path: PathBuf, size: usize) -> Message {
    Message {
        id: 1,
        created: now(),
        path,
        return_path: "alice@a.example".to_string(),
        return_path_lcase: "alice@a.example".to_string(),
        return_path_domain: "a.example".to_string(),
        recipients: vec![
            Recipient {
                domain_idx: 0,
                address: "bob@b.example".to_string(),
                address_lcase: "bob@b.example".to_string(),
                status: Status::Scheduled,
                flags: RCPT_NOTIFY_DELAY | RCPT_NOTIFY_FAILURE,
                orcpt: None,
            },
            Recipient {
                domain_idx: 0,
                address: "gone@b.example".to_string(),
                address_lcase: "gone@b.example".to_string(),
                status: Status::Scheduled,
                flags: RCPT_NOTIFY_DELAY | RCPT_NOTIFY_FAILURE,
                orcpt: None,
            },
        ],
        domains: vec![Domain {
            domain: "b.example".to_string(),
            retry: Schedule::now(),
            notify: Schedule::later(Duration::from_secs(86400)),
            expires: now() + 5 * 86400,
            status: Status::Scheduled,
            changed: false,
        }],
        flags: 0,
        env_id: None,
        priority: 0,
        transport: None,
        size,
        quota_refs: Vec::new(),
    }
}

#[tokio::test]
async fn per_recipient_codes_are_captured() {
    let raw_message = b"From: alice@a.example\r\nTo: bob@b.example\r\nSubject: hi\r\n\r\nok\r\n";
    let spool = std::env::temp_dir().join(format!(
        "maild-test-outbound-{}-{}.msg",
        std::process::id(),
        now()
    ));
    tokio::fs::write(&spool, raw_message).await.unwrap();

    let (client_side, server_side) = duplex(1024 * 1024);
    let (log_tx, mut log_rx) = tokio::sync::mpsc::channel(64);
    let server = tokio::spawn(fake_remote(server_side, log_tx));

    let mut message = test_message(spool.clone(), raw_message.len());
    let client = SmtpClient {
        stream: client_side,
        timeout: Duration::from_secs(5),
    };
    let mut capabilities = EhloResponse::new("mx.b.example".to_string());
    capabilities.capabilities = EXT_SIZE | EXT_DSN;

    let mut recipients = std::mem::take(&mut message.recipients);
    let status = message
        .deliver(
            client,
            &capabilities,
            recipients.iter_mut(),
            DeliveryParams {
                hostname: "mx.b.example",
                credentials: None,
                timeout_mail: Duration::from_secs(5),
                timeout_rcpt: Duration::from_secs(5),
                timeout_data: Duration::from_secs(5),
            },
        )
        .await;

    // Both recipients are terminal: one delivered, one failed permanently.
    assert_eq!(status, Status::Completed(()));
    assert!(
        matches!(&recipients[0].status, Status::Completed(response) if response.response.code() == 250),
        "{:?}",
        recipients[0].status
    );
    assert!(
        matches!(&recipients[1].status, Status::PermanentFailure(response) if response.response.code() == 550),
        "{:?}",
        recipients[1].status
    );

    // The remote saw the envelope commands in order, one RCPT per recipient.
    server.abort();
    let mut commands = Vec::new();
    while let Ok(line) = log_rx.try_recv() {
        commands.push(line);
    }
    let mail_pos = commands
        .iter()
        .position(|line| line.starts_with("MAIL FROM:<alice@a.example> SIZE="))
        .expect("MAIL FROM sent");
    let rcpt_count = commands
        .iter()
        .filter(|line| line.starts_with("RCPT TO:"))
        .count();
    assert_eq!(rcpt_count, 2, "{commands:?}");
    assert!(
        commands[mail_pos + 1].starts_with("RCPT TO:<bob@b.example>"),
        "{commands:?}"
    );

    let _ = tokio::fs::remove_file(&spool).await;
}
