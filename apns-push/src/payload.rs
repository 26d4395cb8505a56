//! Payload encoding and binary framing for the push wire protocol.
//!
//! Frame layout, big-endian:
//!
//! ```text
//! offset  size  field
//! 0       1     command = 0x00
//! 1       2     token length = 32
//! 3       32    raw device token
//! 35      2     payload length (N)
//! 37      N     JSON payload bytes
//! ```

use serde_json::{Map, Value};

use apns_core::{Device, Notification};

/// Hard limit on the encoded JSON payload, checked before any network I/O.
pub const MAX_PAYLOAD_BYTES: usize = 256;
/// Raw device token length in bytes (64 hex characters).
pub const TOKEN_LEN: usize = 32;
/// Command identifier for the simple notification format.
pub const PUSH_COMMAND: u8 = 0;
/// Frame bytes in front of the payload: command + token length + token +
/// payload length.
pub const FRAME_OVERHEAD: usize = 1 + 2 + TOKEN_LEN + 2;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is {0} bytes, limit is {max}", max = MAX_PAYLOAD_BYTES)]
    TooLarge(usize),

    #[error("device token {0:?} is not {len} bytes of hex", len = TOKEN_LEN)]
    InvalidToken(String),
}

/// Encode a notification as its compact JSON wire payload.
///
/// The reserved `aps` object holds `alert`, `badge`, and `sound` when set;
/// every `extra` key is merged beside it at the top level and wins on
/// collision. Pure, no side effects.
pub fn build_payload(notification: &Notification) -> Vec<u8> {
    let mut aps = Map::new();
    if let Some(alert) = &notification.alert {
        aps.insert("alert".to_string(), Value::String(alert.clone()));
    }
    if let Some(badge) = notification.badge {
        aps.insert("badge".to_string(), Value::from(badge));
    }
    if let Some(sound) = &notification.sound {
        aps.insert("sound".to_string(), Value::String(sound.clone()));
    }

    let mut root = Map::new();
    root.insert("aps".to_string(), Value::Object(aps));
    if let Some(extra) = &notification.extra {
        for (key, value) in extra {
            root.insert(key.clone(), value.clone());
        }
    }

    serde_json::to_vec(&Value::Object(root)).unwrap_or_default()
}

/// True iff the encoded payload fits the wire limit.
pub fn is_valid_length(notification: &Notification) -> bool {
    build_payload(notification).len() <= MAX_PAYLOAD_BYTES
}

/// Build the complete binary frame for one destination.
pub fn frame_message(payload: &[u8], device: &Device) -> Result<Vec<u8>, PayloadError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(PayloadError::TooLarge(payload.len()));
    }
    let token =
        hex::decode(&device.token).map_err(|_| PayloadError::InvalidToken(device.token.clone()))?;
    if token.len() != TOKEN_LEN {
        return Err(PayloadError::InvalidToken(device.token.clone()));
    }

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.push(PUSH_COMMAND);
    frame.extend_from_slice(&(TOKEN_LEN as u16).to_be_bytes());
    frame.extend_from_slice(&token);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> String {
        "ab".repeat(TOKEN_LEN)
    }

    fn alert(text: &str) -> Notification {
        Notification {
            alert: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_alert_payload() {
        let payload = build_payload(&alert("Hi"));
        assert_eq!(payload, br#"{"aps":{"alert":"Hi"}}"#);
        assert_eq!(payload.len(), 22);
        assert!(is_valid_length(&alert("Hi")));
    }

    #[test]
    fn frame_is_overhead_plus_payload() {
        let payload = build_payload(&alert("Hi"));
        let frame = frame_message(&payload, &Device::new(token())).unwrap();
        assert_eq!(frame.len(), FRAME_OVERHEAD + payload.len());

        // Fixed header fields round-trip.
        assert_eq!(frame[0], PUSH_COMMAND);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), TOKEN_LEN as u16);
        assert_eq!(hex::encode(&frame[3..35]), token());
        assert_eq!(
            u16::from_be_bytes([frame[35], frame[36]]),
            payload.len() as u16
        );
        assert_eq!(&frame[37..], &payload[..]);
    }

    #[test]
    fn badge_and_sound_are_optional_fields() {
        let notification = Notification {
            alert: Some("Hi".to_string()),
            badge: Some(3),
            sound: Some("chime".to_string()),
            ..Default::default()
        };
        let payload = build_payload(&notification);
        assert_eq!(payload, br#"{"aps":{"alert":"Hi","badge":3,"sound":"chime"}}"#);
    }

    #[test]
    fn extra_merges_at_top_level_and_wins_on_collision() {
        let mut extra = Map::new();
        extra.insert("thread".to_string(), Value::from(7));
        extra.insert("aps".to_string(), Value::from("clobbered"));
        let notification = Notification {
            alert: Some("Hi".to_string()),
            extra: Some(extra),
            ..Default::default()
        };
        let value: Value = serde_json::from_slice(&build_payload(&notification)).unwrap();
        assert_eq!(value["thread"], Value::from(7));
        assert_eq!(value["aps"], Value::from("clobbered"));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let notification = alert(&"x".repeat(300));
        assert!(!is_valid_length(&notification));
        let payload = build_payload(&notification);
        assert!(payload.len() > MAX_PAYLOAD_BYTES);
        let err = frame_message(&payload, &Device::new(token())).unwrap_err();
        assert!(matches!(err, PayloadError::TooLarge(n) if n == payload.len()));
    }

    #[test]
    fn boundary_payload_is_accepted() {
        // 256 bytes exactly: {"aps":{"alert":"..."}} has 22 bytes of scaffolding.
        let notification = alert(&"x".repeat(MAX_PAYLOAD_BYTES - 22 + 2));
        let payload = build_payload(&notification);
        assert_eq!(payload.len(), MAX_PAYLOAD_BYTES);
        assert!(is_valid_length(&notification));
        assert!(frame_message(&payload, &Device::new(token())).is_ok());
    }

    #[test]
    fn bad_tokens_are_rejected() {
        let payload = build_payload(&alert("Hi"));
        for bad in ["zz".repeat(32), "ab".repeat(16), "abc".to_string()] {
            let err = frame_message(&payload, &Device::new(bad.clone())).unwrap_err();
            assert!(matches!(err, PayloadError::InvalidToken(t) if t == bad));
        }
    }

    #[test]
    fn payload_is_compact() {
        let payload = build_payload(&alert("Hi"));
        assert!(!payload.contains(&b' '));
        assert!(!payload.contains(&b'\n'));
    }
}
