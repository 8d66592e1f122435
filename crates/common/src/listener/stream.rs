/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::borrow::Cow;

use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::TcpStream,
};
use tokio_rustls::server::TlsStream;

pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    fn is_tls(&self) -> bool;
    fn tls_version_and_cipher(&self) -> (Cow<'static, str>, Cow<'static, str>);
}

impl SessionStream for TcpStream {
    fn is_tls(&self) -> bool {
        false
    }

    fn tls_version_and_cipher(&self) -> (Cow<'static, str>, Cow<'static, str>) {
        ("".into(), "".into())
    }
}

impl<T: SessionStream> SessionStream for TlsStream<T> {
    fn is_tls(&self) -> bool {
        true
    }

    fn tls_version_and_cipher(&self) -> (Cow<'static, str>, Cow<'static, str>) {
        let (_, conn) = self.get_ref();
        (
            match conn
                .protocol_version()
                .unwrap_or(rustls::ProtocolVersion::Unknown(0))
            {
                rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2".into(),
                rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3".into(),
                _ => "unknown".into(),
            },
            match conn.negotiated_cipher_suite() {
                Some(suite) => suite.suite().as_str().unwrap_or("unknown").into(),
                None => "unknown".into(),
            },
        )
    }
}

// Used by the in-memory test harness.
impl SessionStream for DuplexStream {
    fn is_tls(&self) -> bool {
        true
    }

    fn tls_version_and_cipher(&self) -> (Cow<'static, str>, Cow<'static, str>) {
        ("TLSv1.3".into(), "TLS13_AES_128_GCM_SHA256".into())
    }
}
