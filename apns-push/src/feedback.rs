//! Feedback service client: streams fixed-size binary records naming the
//! device tokens the gateway considers permanently undeliverable.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use apns_core::{Device, ServiceConfig, StaleToken, TimeoutConfig};

use crate::connection::{ConnectionError, ReadOutcome, TlsConnector};
use crate::payload::TOKEN_LEN;

/// One feedback record: 4-byte timestamp, 2-byte token length, 32-byte raw
/// token, all big-endian.
pub const FEEDBACK_RECORD_LEN: usize = 4 + 2 + TOKEN_LEN;

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("feedback connection failed: {0}")]
    Connect(#[source] ConnectionError),

    /// The stream failed before the peer's clean close. Records collected
    /// before the fault are preserved so the caller may apply them anyway.
    #[error("feedback stream failed after {count} records: {source}", count = .collected.len())]
    Transport {
        collected: Vec<StaleToken>,
        #[source]
        source: ConnectionError,
    },
}

/// Client for one service's feedback endpoint. Uses the same certificate
/// material as the push path, but the feedback host and port.
pub struct FeedbackClient {
    connector: TlsConnector,
    hostname: String,
    port: u16,
}

impl FeedbackClient {
    pub fn new(
        service: &ServiceConfig,
        timeouts: TimeoutConfig,
    ) -> Result<Self, ConnectionError> {
        Ok(FeedbackClient {
            connector: TlsConnector::from_service(service, timeouts)?,
            hostname: service.feedback_hostname.clone(),
            port: service.feedback_port,
        })
    }

    /// Read records until the peer performs its orderly close, which is the
    /// only normal termination of the stream. The connection is closed
    /// before returning, on success and on failure alike.
    pub async fn fetch_stale_tokens(&self) -> Result<Vec<StaleToken>, FeedbackError> {
        let mut conn = self
            .connector
            .open(&self.hostname, self.port)
            .await
            .map_err(FeedbackError::Connect)?;

        let mut tokens = Vec::new();
        let mut record = [0u8; FEEDBACK_RECORD_LEN];
        let result = loop {
            match conn.read_exact_or_eof(&mut record).await {
                Ok(ReadOutcome::Filled) => tokens.push(decode_record(&record)),
                // The peer's orderly close is the stream's only normal end.
                Ok(ReadOutcome::EndOfStream) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        conn.close().await;

        match result {
            Ok(()) => {
                tracing::info!("Feedback service reported {} stale tokens", tokens.len());
                Ok(tokens)
            }
            Err(source) => Err(FeedbackError::Transport {
                collected: tokens,
                source,
            }),
        }
    }
}

fn decode_record(record: &[u8; FEEDBACK_RECORD_LEN]) -> StaleToken {
    let secs = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
    // The 2-byte token length field is fixed at 32 on the wire and not
    // branched on.
    StaleToken {
        timestamp: DateTime::<Utc>::from_timestamp(i64::from(secs), 0).unwrap_or_default(),
        token: hex::encode(&record[6..]),
    }
}

/// Apply a feedback report to an in-memory device list: every active device
/// whose token appears in `stale` is flagged inactive with `deactivated_at`
/// set. Returns how many devices changed. Unknown tokens are ignored;
/// nothing is ever deleted.
pub fn deactivate_stale(devices: &mut [Device], stale: &[StaleToken], now: DateTime<Utc>) -> usize {
    let tokens: HashSet<String> = stale.iter().map(|s| s.token.to_ascii_lowercase()).collect();
    let mut changed = 0;
    for device in devices.iter_mut() {
        if device.is_active && tokens.contains(&device.token.to_ascii_lowercase()) {
            device.is_active = false;
            device.deactivated_at = Some(now);
            changed += 1;
        }
    }
    if changed > 0 {
        tracing::info!("Deactivated {} devices from feedback report", changed);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::read_full;
    use std::io;
    use std::time::Duration;
    use tokio::io::AsyncRead;

    /// The record loop of `fetch_stale_tokens`, driven over any byte stream.
    async fn collect_records<S: AsyncRead + Unpin>(
        stream: &mut S,
        out: &mut Vec<StaleToken>,
    ) -> Result<(), ConnectionError> {
        let mut record = [0u8; FEEDBACK_RECORD_LEN];
        loop {
            match read_full(stream, &mut record, Duration::from_secs(1)).await? {
                ReadOutcome::EndOfStream => return Ok(()),
                ReadOutcome::Filled => out.push(decode_record(&record)),
            }
        }
    }

    fn record(secs: u32, token_byte: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FEEDBACK_RECORD_LEN);
        buf.extend_from_slice(&secs.to_be_bytes());
        buf.extend_from_slice(&(TOKEN_LEN as u16).to_be_bytes());
        buf.extend_from_slice(&[token_byte; TOKEN_LEN]);
        buf
    }

    #[tokio::test]
    async fn complete_records_then_clean_close() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&record(1_700_000_000, 0xaa));
        stream.extend_from_slice(&record(1_700_000_100, 0xbb));
        stream.extend_from_slice(&record(1_700_000_200, 0xcc));

        let mut out = Vec::new();
        collect_records(&mut stream.as_slice(), &mut out)
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].token, "aa".repeat(TOKEN_LEN));
        assert_eq!(out[1].token, "bb".repeat(TOKEN_LEN));
        assert_eq!(out[0].timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn empty_stream_yields_no_tokens() {
        let mut empty: &[u8] = &[];
        let mut out = Vec::new();
        collect_records(&mut empty, &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn truncated_record_fails_but_keeps_collected_tokens() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&record(1_700_000_000, 0xaa));
        stream.extend_from_slice(&record(1_700_000_100, 0xbb)[..10].to_vec());

        let mut out = Vec::new();
        let err = collect_records(&mut stream.as_slice(), &mut out)
            .await
            .unwrap_err();

        match err {
            ConnectionError::Transport(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].token, "aa".repeat(TOKEN_LEN));
    }

    #[test]
    fn stale_tokens_deactivate_matching_devices_only() {
        let now = Utc::now();
        let mut devices = vec![
            Device::new("aa".repeat(TOKEN_LEN)),
            Device::new("bb".repeat(TOKEN_LEN)),
        ];
        let stale = vec![
            StaleToken {
                timestamp: now,
                token: "AA".repeat(TOKEN_LEN), // case-insensitive match
            },
            StaleToken {
                timestamp: now,
                token: "dd".repeat(TOKEN_LEN), // no matching device
            },
        ];

        assert_eq!(deactivate_stale(&mut devices, &stale, now), 1);
        assert!(!devices[0].is_active);
        assert_eq!(devices[0].deactivated_at, Some(now));
        assert!(devices[1].is_active);
        assert!(devices[1].deactivated_at.is_none());

        // Already-deactivated devices are not counted twice.
        assert_eq!(deactivate_stale(&mut devices, &stale, now), 0);
    }
}
