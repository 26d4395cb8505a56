//! Mutual-TLS connections to the push gateway and feedback service.
//!
//! This layer knows nothing about the wire protocol. It opens one socket,
//! writes byte buffers, reads exact-size buffers, and classifies failures so
//! the dispatcher can tell an expected peer-initiated close apart from a
//! genuine transport fault.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;

use apns_core::{ServiceConfig, TimeoutConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Certificate or key material could not be parsed or used.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The private key is encrypted and the passphrase is missing or wrong.
    #[error("private key passphrase rejected")]
    InvalidPassphrase,

    /// TCP connect or TLS handshake failed.
    #[error("connect to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// The peer closed the connection. During a push this is the gateway's
    /// only signal that a token in the stream was invalid.
    #[error("peer closed the connection")]
    PeerReset,

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("connection already closed")]
    Closed,
}

impl ConnectionError {
    /// True for the recoverable peer-reset pattern the dispatcher resumes
    /// from. Everything else is a fatal transport or configuration fault.
    pub fn is_peer_reset(&self) -> bool {
        matches!(self, ConnectionError::PeerReset)
    }
}

// The gateway reports an invalid token by dropping the TCP connection, so
// these kinds are the expected fault signal rather than transport bugs.
fn is_reset_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

/// Result of an exact-size read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The buffer was filled completely.
    Filled,
    /// The peer shut the stream down cleanly before the first byte.
    EndOfStream,
}

/// Builds TLS client configuration from a [`ServiceConfig`] once, then opens
/// connections on demand. Each connection has an explicit, scoped lifetime;
/// a faulted connection is never reused.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
    timeouts: TimeoutConfig,
}

// Manual impl: the parsed key material inside `ClientConfig` has no business
// in debug output.
impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Parse the service's certificate and private key and build the client
    /// TLS configuration. This is where configuration errors surface, before
    /// any socket is opened.
    pub fn from_service(
        service: &ServiceConfig,
        timeouts: TimeoutConfig,
    ) -> Result<Self, ConnectionError> {
        let certs: Vec<CertificateDer<'static>> =
            CertificateDer::pem_slice_iter(service.certificate.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    ConnectionError::Certificate(format!("unable to parse certificate PEM: {e:?}"))
                })?;
        if certs.is_empty() {
            return Err(ConnectionError::Certificate(
                "no certificates found in PEM data".to_string(),
            ));
        }

        let key = load_private_key(&service.private_key, service.passphrase.as_deref())?;
        let roots = build_root_store(service.ca_certificate.as_deref())?;

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ConnectionError::Certificate(e.to_string()))?;

        Ok(TlsConnector {
            config: Arc::new(config),
            timeouts,
        })
    }

    /// TCP connect plus TLS handshake, presenting the client certificate.
    pub async fn open(&self, host: &str, port: u16) -> Result<TlsConnection, ConnectionError> {
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|e| ConnectionError::Connect {
                host: host.to_string(),
                port,
                reason: format!("invalid server name: {e}"),
            })?;

        let tcp = timeout(self.timeouts.connect, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectionError::Timeout { op: "connect" })?
            .map_err(|e| ConnectionError::Connect {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        let _ = tcp.set_nodelay(true);

        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        let stream = timeout(self.timeouts.connect, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ConnectionError::Timeout { op: "handshake" })?
            .map_err(|e| ConnectionError::Connect {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        tracing::debug!("TLS connection established to {}:{}", host, port);

        Ok(TlsConnection {
            stream: Some(stream),
            timeouts: self.timeouts,
        })
    }
}

/// One open mutual-TLS socket.
pub struct TlsConnection {
    stream: Option<TlsStream<TcpStream>>,
    timeouts: TimeoutConfig,
}

impl TlsConnection {
    /// Write and flush one byte buffer.
    ///
    /// A peer-initiated close maps to [`ConnectionError::PeerReset`], and so
    /// does a write timeout: a peer that stopped reading cannot confirm
    /// delivery any more than one that reset the socket.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let write_timeout = self.timeouts.write;
        let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;

        let result = timeout(write_timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if is_reset_kind(e.kind()) => Err(ConnectionError::PeerReset),
            Ok(Err(e)) => Err(ConnectionError::Transport(e)),
            Err(_) => Err(ConnectionError::PeerReset),
        }
    }

    /// Fill `buf` completely, or report a clean end of stream if the peer
    /// shut down before the first byte arrived.
    pub async fn read_exact_or_eof(
        &mut self,
        buf: &mut [u8],
    ) -> Result<ReadOutcome, ConnectionError> {
        let read_timeout = self.timeouts.read;
        let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
        read_full(stream, buf, read_timeout).await
    }

    /// Orderly TLS shutdown followed by socket close. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Ignoring TLS shutdown error: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

/// Read exactly `buf.len()` bytes, distinguishing a clean pre-record close
/// from a mid-record truncation.
pub(crate) async fn read_full<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    read_timeout: Duration,
) -> Result<ReadOutcome, ConnectionError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = timeout(read_timeout, stream.read(&mut buf[filled..]))
            .await
            .map_err(|_| ConnectionError::Timeout { op: "read" })?
            .map_err(ConnectionError::Transport)?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::EndOfStream);
            }
            return Err(ConnectionError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended mid-record after {filled} bytes"),
            )));
        }
        filled += n;
    }
    Ok(ReadOutcome::Filled)
}

fn load_private_key(
    pem: &str,
    passphrase: Option<&str>,
) -> Result<PrivateKeyDer<'static>, ConnectionError> {
    if pem.contains("ENCRYPTED PRIVATE KEY") {
        let passphrase = passphrase.ok_or(ConnectionError::InvalidPassphrase)?;
        let der = pem_body(pem, "ENCRYPTED PRIVATE KEY")?;
        let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice()).map_err(|e| {
            ConnectionError::Certificate(format!("malformed encrypted private key: {e}"))
        })?;
        let document = encrypted
            .decrypt(passphrase)
            .map_err(|_| ConnectionError::InvalidPassphrase)?;
        Ok(PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
            document.as_bytes().to_vec(),
        )))
    } else {
        PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|e| {
            ConnectionError::Certificate(format!("unable to parse private key PEM: {e:?}"))
        })
    }
}

fn pem_body(pem: &str, label: &str) -> Result<Vec<u8>, ConnectionError> {
    use base64::Engine;

    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let (Some(start), Some(stop)) = (pem.find(&begin).map(|i| i + begin.len()), pem.find(&end))
    else {
        return Err(ConnectionError::Certificate(format!(
            "missing {label} block"
        )));
    };
    if stop < start {
        return Err(ConnectionError::Certificate(format!(
            "malformed {label} block"
        )));
    }
    let body: String = pem[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| ConnectionError::Certificate(format!("invalid PEM base64: {e}")))
}

fn build_root_store(ca_pem: Option<&str>) -> Result<RootCertStore, ConnectionError> {
    let mut roots = RootCertStore::empty();
    match ca_pem {
        Some(pem) => {
            for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
                let cert = cert.map_err(|e| {
                    ConnectionError::Certificate(format!("unable to parse CA PEM: {e:?}"))
                })?;
                roots
                    .add(cert)
                    .map_err(|e| ConnectionError::Certificate(e.to_string()))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                tracing::warn!("Skipping unreadable system root: {}", error);
            }
            for cert in native.certs {
                // System stores routinely contain roots rustls rejects.
                let _ = roots.add(cert);
            }
        }
    }
    if roots.is_empty() {
        return Err(ConnectionError::Certificate(
            "no trust anchors available".to_string(),
        ));
    }
    Ok(roots)
}
