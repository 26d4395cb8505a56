//! Batched, fault-tolerant dispatch of one notification to many devices.
//!
//! The gateway gives no per-token acknowledgment. Its only failure signal is
//! closing the TCP connection once it sees an invalid token anywhere in the
//! stream. The dispatcher therefore treats every device written before a
//! peer reset as notified, drops the device whose write faulted, and resumes
//! the rest of the chunk on a brand-new connection.

use async_trait::async_trait;
use chrono::Utc;

use apns_core::{Device, DispatchResult, Notification, ServiceConfig, TimeoutConfig};

use crate::connection::{ConnectionError, TlsConnection, TlsConnector};
use crate::payload::{build_payload, frame_message, PayloadError, MAX_PAYLOAD_BYTES};

/// Reference batch size: devices written per connection.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("chunk size must be a positive integer")]
    InvalidChunkSize,

    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// An unrecognized transport fault aborted the dispatch. Progress made
    /// before the fault is preserved in `partial`.
    #[error("dispatch aborted after {count} deliveries: {source}", count = .partial.notified.len())]
    Aborted {
        partial: DispatchResult,
        #[source]
        source: ConnectionError,
    },
}

/// Write half of one gateway connection, as the dispatcher sees it.
#[async_trait]
pub trait PushTransport: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError>;
    async fn close(&mut self);
}

/// Opens a fresh gateway connection per chunk and per recovery attempt.
#[async_trait]
pub trait PushConnector: Send + Sync {
    type Transport: PushTransport;

    async fn connect(&self) -> Result<Self::Transport, ConnectionError>;
}

#[async_trait]
impl PushTransport for TlsConnection {
    async fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.write(frame).await
    }

    async fn close(&mut self) {
        TlsConnection::close(self).await;
    }
}

/// Production connector: mutual TLS to the service's push gateway.
pub struct TlsPushConnector {
    connector: TlsConnector,
    hostname: String,
    port: u16,
}

#[async_trait]
impl PushConnector for TlsPushConnector {
    type Transport = TlsConnection;

    async fn connect(&self) -> Result<TlsConnection, ConnectionError> {
        self.connector.open(&self.hostname, self.port).await
    }
}

pub struct PushDispatcher<C = TlsPushConnector> {
    connector: C,
    chunk_size: usize,
}

// Unconditional impl so test doubles need not be Debug themselves.
impl<C> std::fmt::Debug for PushDispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushDispatcher")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl PushDispatcher<TlsPushConnector> {
    /// Build a dispatcher for one service. Certificate material is parsed
    /// here, so a broken configuration fails before any dispatch.
    pub fn new(
        service: &ServiceConfig,
        timeouts: TimeoutConfig,
    ) -> Result<Self, ConnectionError> {
        let connector = TlsPushConnector {
            connector: TlsConnector::from_service(service, timeouts)?,
            hostname: service.hostname.clone(),
            port: service.port,
        };
        Ok(PushDispatcher {
            connector,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self, DispatchError> {
        if chunk_size == 0 {
            return Err(DispatchError::InvalidChunkSize);
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }
}

impl<C: PushConnector> PushDispatcher<C> {
    pub fn with_connector(connector: C, chunk_size: usize) -> Result<Self, DispatchError> {
        if chunk_size == 0 {
            return Err(DispatchError::InvalidChunkSize);
        }
        Ok(PushDispatcher {
            connector,
            chunk_size,
        })
    }

    /// Deliver `notification` to every active device.
    ///
    /// On success the notification's `last_sent_at` is set and the result
    /// lists notified, dropped, and invalid devices. Dropped devices are
    /// expected steady state, not a failure of the call.
    pub async fn push(
        &self,
        notification: &mut Notification,
        devices: &[Device],
    ) -> Result<DispatchResult, DispatchError> {
        let payload = build_payload(notification);
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(DispatchError::Payload(PayloadError::TooLarge(payload.len())));
        }

        let active: Vec<&Device> = devices.iter().filter(|d| d.is_active).collect();
        tracing::info!(
            "Dispatching to {} active devices ({} total) in chunks of {}",
            active.len(),
            devices.len(),
            self.chunk_size
        );

        let mut notified: Vec<Device> = Vec::new();
        let mut dropped: Vec<Device> = Vec::new();
        let mut invalid: Vec<Device> = Vec::new();

        for chunk in active.chunks(self.chunk_size) {
            let mut start = 0;
            while start < chunk.len() {
                let mut conn = match self.connector.connect().await {
                    Ok(conn) => conn,
                    Err(source) => return Err(abort(notified, dropped, invalid, source)),
                };
                match run_chunk(&mut conn, &payload, &chunk[start..], &mut notified, &mut invalid)
                    .await
                {
                    RunOutcome::Complete => {
                        conn.close().await;
                        break;
                    }
                    RunOutcome::FaultAt(i) => {
                        conn.close().await;
                        let culprit = chunk[start + i];
                        tracing::warn!(
                            "Gateway closed the connection at token {}; skipping it and resuming",
                            culprit.token
                        );
                        dropped.push(culprit.clone());
                        start += i + 1;
                    }
                    RunOutcome::Fatal(source) => {
                        conn.close().await;
                        return Err(abort(notified, dropped, invalid, source));
                    }
                }
            }
        }

        let sent_at = Utc::now();
        for device in &mut notified {
            device.last_notified_at = Some(sent_at);
        }
        notification.last_sent_at = Some(sent_at);

        tracing::info!(
            "Dispatch complete: {} notified, {} dropped, {} invalid",
            notified.len(),
            dropped.len(),
            invalid.len()
        );

        Ok(DispatchResult {
            notified,
            dropped,
            invalid,
            sent_at,
        })
    }
}

enum RunOutcome {
    Complete,
    /// Peer reset while writing the device at this index of the pending
    /// slice.
    FaultAt(usize),
    Fatal(ConnectionError),
}

async fn run_chunk<T: PushTransport>(
    conn: &mut T,
    payload: &[u8],
    pending: &[&Device],
    notified: &mut Vec<Device>,
    invalid: &mut Vec<Device>,
) -> RunOutcome {
    for (i, device) in pending.iter().enumerate() {
        let frame = match frame_message(payload, device) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Skipping device with unframeable token: {}", e);
                invalid.push((*device).clone());
                continue;
            }
        };
        match conn.send(&frame).await {
            // No synchronous acknowledgment exists; a completed write is a
            // delivery as far as this protocol can know.
            Ok(()) => notified.push((*device).clone()),
            Err(e) if e.is_peer_reset() => return RunOutcome::FaultAt(i),
            Err(e) => return RunOutcome::Fatal(e),
        }
    }
    RunOutcome::Complete
}

fn abort(
    mut notified: Vec<Device>,
    dropped: Vec<Device>,
    invalid: Vec<Device>,
    source: ConnectionError,
) -> DispatchError {
    let sent_at = Utc::now();
    for device in &mut notified {
        device.last_notified_at = Some(sent_at);
    }
    DispatchError::Aborted {
        partial: DispatchResult {
            notified,
            dropped,
            invalid,
            sent_at,
        },
        source,
    }
}
