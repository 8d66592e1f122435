/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use rustls_pki_types::ServerName;
use smtp_proto::{response::parser::ResponseReceiver, EhloResponse, Response, EXT_START_TLS};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};
use tokio_rustls::{client::TlsStream, TlsConnector};

#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Timeout,
    UnparseableReply,
    UnexpectedReply(Response<String>),
    Tls(std::io::Error),
    InvalidTlsName,
    MissingStartTls,
}

impl Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "I/O error: {err}"),
            ClientError::Timeout => f.write_str("Connection timed out"),
            ClientError::UnparseableReply => f.write_str("Unparseable reply"),
            ClientError::UnexpectedReply(response) => {
                write!(f, "Unexpected reply: {response}")
            }
            ClientError::Tls(err) => write!(f, "TLS error: {err}"),
            ClientError::InvalidTlsName => f.write_str("Invalid TLS server name"),
            ClientError::MissingStartTls => f.write_str("STARTTLS not advertised by host"),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

/// A minimal SMTP client for queue deliveries: banner, EHLO, STARTTLS,
/// envelope commands and dot-stuffed message transfer. Policy decisions stay
/// with the caller.
pub struct SmtpClient<T: AsyncRead + AsyncWrite + Unpin> {
    pub stream: T,
    pub timeout: Duration,
}

impl SmtpClient<TcpStream> {
    pub async fn connect(remote: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        match tokio::time::timeout(timeout, TcpStream::connect(remote)).await {
            Ok(Ok(stream)) => Ok(SmtpClient { stream, timeout }),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Connects from a specific source address, used with multi-homed
    /// outbound pools.
    pub async fn connect_using(
        source_ip: IpAddr,
        remote: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(SocketAddr::new(source_ip, 0))?;
        match tokio::time::timeout(timeout, socket.connect(remote)).await {
            Ok(Ok(stream)) => Ok(SmtpClient { stream, timeout }),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> SmtpClient<T> {
    pub async fn read_response(&mut self) -> Result<Response<String>, ClientError> {
        let mut buf = vec![0u8; 1024];
        let mut parser = ResponseReceiver::default();
        loop {
            let read = match tokio::time::timeout(self.timeout, self.stream.read(&mut buf)).await
            {
                Ok(result) => result?,
                Err(_) => return Err(ClientError::Timeout),
            };
            if read == 0 {
                return Err(ClientError::UnparseableReply);
            }
            match parser.parse(&mut buf[..read].iter()) {
                Ok(response) => return Ok(response),
                Err(smtp_proto::Error::NeedsMoreData { .. }) => (),
                Err(_) => return Err(ClientError::UnparseableReply),
            }
        }
    }

    pub async fn read_greeting(&mut self, hostname: &str) -> Result<(), ClientError> {
        let response = self.read_response().await?;
        if response.severity() == smtp_proto::Severity::PositiveCompletion {
            Ok(())
        } else {
            tracing::debug!(
                context = "client",
                event = "invalid-greeting",
                hostname = hostname,
                response = %response);
            Err(ClientError::UnexpectedReply(response))
        }
    }

    pub async fn cmd(&mut self, command: &[u8]) -> Result<Response<String>, ClientError> {
        match tokio::time::timeout(self.timeout, async {
            self.stream.write_all(command).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::Timeout),
        }
        self.read_response().await
    }

    pub async fn ehlo(&mut self, local_hostname: &str) -> Result<EhloResponse<String>, ClientError> {
        match tokio::time::timeout(self.timeout, async {
            self.stream
                .write_all(format!("EHLO {local_hostname}\r\n").as_bytes())
                .await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::Timeout),
        }

        let mut buf = vec![0u8; 4096];
        loop {
            let read = match tokio::time::timeout(self.timeout, self.stream.read(&mut buf)).await
            {
                Ok(result) => result?,
                Err(_) => return Err(ClientError::Timeout),
            };
            if read == 0 {
                return Err(ClientError::UnparseableReply);
            }
            match EhloResponse::parse(&mut buf[..read].iter()) {
                Ok(response) => return Ok(response),
                Err(smtp_proto::Error::NeedsMoreData { .. }) => (),
                Err(_) => return Err(ClientError::UnparseableReply),
            }
        }
    }

    /// Relay authentication; only AUTH PLAIN, relays are operator
    /// configured and always reached over TLS.
    pub async fn authenticate(
        &mut self,
        username: &str,
        secret: &str,
    ) -> Result<(), ClientError> {
        let token = STANDARD.encode(format!("\0{username}\0{secret}"));
        let response = self.cmd(format!("AUTH PLAIN {token}\r\n").as_bytes()).await?;
        if response.code() == 235 {
            Ok(())
        } else {
            Err(ClientError::UnexpectedReply(response))
        }
    }

    /// Sends DATA plus the dot-stuffed message, without reading the final
    /// response; the caller owns its interpretation.
    pub async fn send_message(
        &mut self,
        headers: Option<&[u8]>,
        body: &[u8],
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let response = self.cmd(b"DATA\r\n").await?;
        if response.code() != 354 {
            return Err(ClientError::UnexpectedReply(response));
        }

        match tokio::time::timeout(timeout, async {
            if let Some(headers) = headers {
                write_dot_stuffed(&mut self.stream, headers, true).await?;
            }
            write_dot_stuffed(&mut self.stream, body, headers.is_none()).await?;
            if body.ends_with(b"\r\n") {
                self.stream.write_all(b".\r\n").await?;
            } else {
                self.stream.write_all(b"\r\n.\r\n").await?;
            }
            self.stream.flush().await
        })
        .await
        {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub async fn quit(mut self) {
        let _ = tokio::time::timeout(Duration::from_secs(10), async {
            let _ = self.stream.write_all(b"QUIT\r\n").await;
            let _ = self.stream.flush().await;
        })
        .await;
    }
}

impl SmtpClient<TcpStream> {
    pub async fn start_tls(
        mut self,
        connector: &TlsConnector,
        hostname: &str,
        capabilities: &EhloResponse<String>,
    ) -> Result<SmtpClient<TlsStream<TcpStream>>, (ClientError, Option<Self>)> {
        if !capabilities.has_capability(EXT_START_TLS) {
            return Err((ClientError::MissingStartTls, Some(self)));
        }
        match self.cmd(b"STARTTLS\r\n").await {
            Ok(response) if response.code() == 220 => self.into_tls(connector, hostname).await,
            Ok(response) => Err((ClientError::UnexpectedReply(response), Some(self))),
            Err(err) => Err((err, None)),
        }
    }

    pub async fn into_tls(
        self,
        connector: &TlsConnector,
        hostname: &str,
    ) -> Result<SmtpClient<TlsStream<TcpStream>>, (ClientError, Option<Self>)> {
        let Ok(server_name) = ServerName::try_from(hostname.to_string()) else {
            return Err((ClientError::InvalidTlsName, Some(self)));
        };
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, connector.connect(server_name, self.stream)).await {
            Ok(Ok(stream)) => Ok(SmtpClient { stream, timeout }),
            Ok(Err(err)) => Err((ClientError::Tls(err), None)),
            Err(_) => Err((ClientError::Timeout, None)),
        }
    }
}

impl SmtpClient<TlsStream<TcpStream>> {
    /// Certificates presented by the peer, for DANE verification.
    pub fn peer_certificates(&self) -> Option<&[rustls_pki_types::CertificateDer<'static>]> {
        self.stream.get_ref().1.peer_certificates()
    }
}

async fn write_dot_stuffed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    mut at_line_start: bool,
) -> std::io::Result<()> {
    let mut start = 0;
    for (pos, &byte) in bytes.iter().enumerate() {
        if byte == b'.' && at_line_start {
            writer.write_all(&bytes[start..=pos]).await?;
            writer.write_all(b".").await?;
            start = pos + 1;
        }
        at_line_start = byte == b'\n';
    }
    if start < bytes.len() {
        writer.write_all(&bytes[start..]).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dot_stuffing() {
        let mut out = Vec::new();
        write_dot_stuffed(&mut out, b".leading\r\nbody\r\n.\r\n..two\r\n", true)
            .await
            .unwrap();
        assert_eq!(out, b"..leading\r\nbody\r\n..\r\n...two\r\n".to_vec());

        let mut out = Vec::new();
        write_dot_stuffed(&mut out, b"no dots\r\nat all\r\n", true)
            .await
            .unwrap();
        assert_eq!(out, b"no dots\r\nat all\r\n".to_vec());
    }
}
