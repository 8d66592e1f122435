/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{net::IpAddr, sync::Arc, time::Duration};

use auth::dkim::DkimSigner;
use common::{
    config::{
        MailAuthConfig, QueueConfig, ReportConfig, ServerProtocol, SessionConfig,
    },
    listener::{limiter::ConcurrencyLimiter, ServerInstance},
    resolver::{DnsResolver, MockResolver},
    store::{MemoryAccounts, MemoryStore},
    Core, Inner, Shutdown,
};
use smtp::{
    core::{Session, SessionData, SessionParameters, State, SMTP},
    queue,
};
use tokio::{
    io::{duplex, AsyncReadExt, DuplexStream},
    sync::mpsc,
};

const REMOTE_IP: &str = "203.0.113.9";

struct TestServer {
    core: Arc<SMTP>,
    store: Arc<MemoryStore>,
    queue_rx: mpsc::Receiver<queue::Event>,
    _report_rx: mpsc::Receiver<smtp::reporting::Event>,
}

fn test_server(mock: MockResolver, signers: Vec<(&str, Arc<DkimSigner>)>) -> TestServer {
    let store = Arc::new(
        MemoryStore::new()
            .with_account("bob@b.example", "bob")
            .with_account("postmaster@b.example", "postmaster"),
    );
    let mut mail_auth = MailAuthConfig {
        local_domains: vec!["b.example".to_string()],
        ..MailAuthConfig::default()
    };
    for (domain, signer) in signers {
        mail_auth
            .signers
            .entry(domain.to_string())
            .or_default()
            .push(signer);
    }
    let queue_path = std::env::temp_dir().join(format!(
        "maild-test-queue-{}-{:x}",
        std::process::id(),
        rand_suffix()
    ));
    let core = Arc::new(Core {
        hostname: "mx.local.example".to_string(),
        session: SessionConfig::default(),
        queue: QueueConfig {
            path: queue_path,
            ..QueueConfig::default()
        },
        mail_auth,
        report: ReportConfig::default(),
        resolver: DnsResolver::mock(mock),
        psl: auth::suffixlist::PublicSuffix::builtin(),
        store: store.clone(),
        accounts: Arc::new(
            MemoryAccounts::default().with_login("alice", "secret", &["alice@a.example"]),
        ),
    });
    let (core, queue_rx, report_rx) = SMTP::new(core, Arc::new(Inner::new()));
    TestServer {
        core,
        store,
        queue_rx,
        _report_rx: report_rx,
    }
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

fn new_session(
    server: &TestServer,
    protocol: ServerProtocol,
) -> (Session<DuplexStream>, DuplexStream) {
    let (server_side, client_side) = duplex(1024 * 1024);
    let instance = Arc::new(ServerInstance {
        id: protocol.as_str().to_string(),
        protocol,
        hostname: "mx.local.example".to_string(),
        tls_acceptor: None,
        tls_implicit: false,
        cert_fingerprint: Vec::new(),
        limiter: ConcurrencyLimiter::new(100),
        shutdown: Shutdown::new(),
    });
    let params = SessionParameters::resolve(&server.core.core.session, protocol);
    let session = Session {
        core: server.core.clone(),
        instance,
        stream: server_side,
        span: tracing::info_span!("test-session"),
        state: State::default(),
        data: SessionData::new(
            "192.0.2.1".parse::<IpAddr>().unwrap(),
            25,
            REMOTE_IP.parse().unwrap(),
            49152,
            server.core.inner.cid.generate(),
        ),
        params,
        in_flight: Vec::new(),
    };
    (session, client_side)
}

async fn send(
    session: &mut Session<DuplexStream>,
    client: &mut DuplexStream,
    command: &str,
) -> String {
    let _ = session.ingest(command.as_bytes()).await;
    read_reply(client).await
}

async fn read_reply(client: &mut DuplexStream) -> String {
    let mut reply = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await {
            Ok(Ok(read)) if read > 0 => reply.extend_from_slice(&buf[..read]),
            _ => break,
        }
    }
    String::from_utf8(reply).unwrap()
}

#[tokio::test]
async fn ehlo_advertises_extensions_and_pipelined_replies_keep_order() {
    let server = test_server(MockResolver::new(), Vec::new());
    let (mut session, mut client) = new_session(&server, ServerProtocol::Smtp);

    let reply = send(&mut session, &mut client, "EHLO mail.c.example\r\n").await;
    assert!(reply.starts_with("250"), "{reply}");
    for extension in ["PIPELINING", "SIZE", "8BITMIME", "SMTPUTF8", "DSN", "REQUIRETLS", "ENHANCEDSTATUSCODES"] {
        assert!(reply.contains(extension), "missing {extension}: {reply}");
    }

    // Three pipelined commands produce three replies in command order.
    let reply = send(&mut session, &mut client, "NOOP\r\nVRFY bob\r\nNOOP\r\n").await;
    let codes = reply
        .lines()
        .map(|line| &line[..3])
        .collect::<Vec<_>>();
    assert_eq!(codes, vec!["250", "252", "250"], "{reply}");
}

#[tokio::test]
async fn spf_fail_with_dmarc_reject_is_rejected_at_data() {
    let mock = MockResolver::new()
        .with_txt("c.example", ["v=spf1 -all"])
        .with_txt("_dmarc.c.example", ["v=DMARC1; p=reject"]);
    let server = test_server(mock, Vec::new());
    let (mut session, mut client) = new_session(&server, ServerProtocol::Smtp);

    send(&mut session, &mut client, "EHLO mail.c.example\r\n").await;
    let reply = send(&mut session, &mut client, "MAIL FROM:<x@c.example>\r\n").await;
    assert!(reply.starts_with("250"), "{reply}");
    let reply = send(&mut session, &mut client, "RCPT TO:<bob@b.example>\r\n").await;
    assert!(reply.starts_with("250"), "{reply}");
    let reply = send(&mut session, &mut client, "DATA\r\n").await;
    assert!(reply.starts_with("354"), "{reply}");

    let reply = send(
        &mut session,
        &mut client,
        "From: x@c.example\r\nTo: bob@b.example\r\nSubject: hi\r\n\r\nok\r\n.\r\n",
    )
    .await;
    assert!(reply.starts_with("550 5.7.1"), "{reply}");
    assert!(server.store.messages.lock().is_empty());
}

#[tokio::test]
async fn dkim_aligned_message_passes_dmarc_without_spf() {
    let signer = auth::dkim::DkimSigner::from_ed25519_key(
        ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
        "d.example",
        "s1",
    );
    let key_record = signer.key_record();
    let message = "From: y@d.example\r\nTo: bob@b.example\r\nSubject: hi\r\n\r\nok\r\n";
    let signature = signer.sign(message.as_bytes()).unwrap();

    let mock = MockResolver::new()
        .with_txt("_dmarc.d.example", ["v=DMARC1; p=reject"])
        .with_txt_owned("s1._domainkey.d.example", vec![key_record]);
    let server = test_server(mock, Vec::new());
    let (mut session, mut client) = new_session(&server, ServerProtocol::Smtp);

    send(&mut session, &mut client, "EHLO mail.d.example\r\n").await;
    send(&mut session, &mut client, "MAIL FROM:<y@d.example>\r\n").await;
    send(&mut session, &mut client, "RCPT TO:<bob@b.example>\r\n").await;
    send(&mut session, &mut client, "DATA\r\n").await;

    let reply = send(
        &mut session,
        &mut client,
        &format!("{signature}{message}.\r\n"),
    )
    .await;
    assert!(reply.starts_with("250"), "{reply}");

    let messages = server.store.messages.lock();
    assert_eq!(messages.len(), 1);
    let stored = String::from_utf8_lossy(&messages[0].message);
    assert!(stored.contains("dkim=pass"), "{stored}");
    assert!(stored.contains("dmarc=pass"), "{stored}");
    assert!(stored.contains("(aligned via dkim)"), "{stored}");
    assert!(stored.contains("Received: from mail.d.example"), "{stored}");
}

#[tokio::test]
async fn message_exceeding_declared_size_is_rejected() {
    let server = test_server(MockResolver::new(), Vec::new());
    let (mut session, mut client) = new_session(&server, ServerProtocol::Smtp);

    send(&mut session, &mut client, "EHLO mail.c.example\r\n").await;
    send(&mut session, &mut client, "MAIL FROM:<x@c.example> SIZE=10\r\n").await;
    send(&mut session, &mut client, "RCPT TO:<bob@b.example>\r\n").await;
    send(&mut session, &mut client, "DATA\r\n").await;
    let reply = send(
        &mut session,
        &mut client,
        "From: x@c.example\r\n\r\nthis body is much longer than ten bytes\r\n.\r\n",
    )
    .await;
    assert!(reply.starts_with("552"), "{reply}");
}

#[tokio::test]
async fn non_ascii_sender_requires_smtputf8() {
    let server = test_server(MockResolver::new(), Vec::new());
    let (mut session, mut client) = new_session(&server, ServerProtocol::Smtp);

    send(&mut session, &mut client, "EHLO mail.c.example\r\n").await;
    let reply = send(&mut session, &mut client, "MAIL FROM:<jos\u{e9}@c.example>\r\n").await;
    assert!(
        reply.starts_with("553") || reply.starts_with("501"),
        "{reply}"
    );
}

#[tokio::test]
async fn relay_denied_and_unknown_mailbox_rejected() {
    let server = test_server(MockResolver::new(), Vec::new());
    let (mut session, mut client) = new_session(&server, ServerProtocol::Smtp);

    send(&mut session, &mut client, "EHLO mail.c.example\r\n").await;
    send(&mut session, &mut client, "MAIL FROM:<x@c.example>\r\n").await;

    let reply = send(&mut session, &mut client, "RCPT TO:<x@elsewhere.example>\r\n").await;
    assert!(reply.starts_with("551"), "{reply}");
    let reply = send(&mut session, &mut client, "RCPT TO:<nobody@b.example>\r\n").await;
    assert!(reply.starts_with("550 5.1.1"), "{reply}");
}

#[tokio::test]
async fn authenticated_submission_is_signed_and_queued() {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let signer = Arc::new(auth::dkim::DkimSigner::from_ed25519_key(
        ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
        "a.example",
        "ed1",
    ));
    let mut server = test_server(MockResolver::new(), vec![("a.example", signer)]);
    let (mut session, mut client) = new_session(&server, ServerProtocol::Submission);

    send(&mut session, &mut client, "EHLO client.a.example\r\n").await;

    // Unauthenticated submissions may not send.
    let reply = send(&mut session, &mut client, "MAIL FROM:<alice@a.example>\r\n").await;
    assert!(reply.starts_with("530"), "{reply}");

    let token = STANDARD.encode("\0alice\0secret");
    let reply = send(&mut session, &mut client, &format!("AUTH PLAIN {token}\r\n")).await;
    assert!(reply.starts_with("235"), "{reply}");

    let reply = send(&mut session, &mut client, "MAIL FROM:<alice@a.example>\r\n").await;
    assert!(reply.starts_with("250"), "{reply}");
    let reply = send(&mut session, &mut client, "RCPT TO:<carol@remote.example>\r\n").await;
    assert!(reply.starts_with("250"), "{reply}");
    send(&mut session, &mut client, "DATA\r\n").await;
    let reply = send(
        &mut session,
        &mut client,
        "From: alice@a.example\r\nTo: carol@remote.example\r\nSubject: hi\r\n\r\nok\r\n.\r\n",
    )
    .await;
    assert!(reply.starts_with("250"), "{reply}");

    // The message went to the queue, durably spooled and DKIM-signed.
    let event = server.queue_rx.try_recv().expect("queued event");
    match event {
        queue::Event::Queue(schedule) => {
            let spooled = tokio::fs::read(&schedule.inner.path).await.unwrap();
            let spooled = String::from_utf8_lossy(&spooled);
            assert!(spooled.contains("DKIM-Signature"), "{spooled}");
            assert!(spooled.contains("d=a.example"), "{spooled}");
            assert_eq!(schedule.inner.recipients.len(), 1);
            assert_eq!(
                schedule.inner.recipients[0].address_lcase,
                "carol@remote.example"
            );
            schedule.inner.remove().await;
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Wrong credentials count as auth failures.
    let (mut session, mut client) = new_session(&server, ServerProtocol::Submission);
    send(&mut session, &mut client, "EHLO client.a.example\r\n").await;
    let token = STANDARD.encode("\0alice\0wrong");
    let reply = send(&mut session, &mut client, &format!("AUTH PLAIN {token}\r\n")).await;
    assert!(reply.starts_with("535"), "{reply}");
}
