use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One destination the push gateway can route to.
///
/// Owned by the surrounding persistence layer; the core receives a read-only
/// list and reports back which devices it believes were notified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// 64 hex characters encoding the 32-byte raw token.
    pub token: String,
    pub is_active: bool,
    #[serde(default)]
    pub last_notified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(token: impl Into<String>) -> Self {
        Device {
            token: token.into(),
            is_active: true,
            last_notified_at: None,
            deactivated_at: None,
        }
    }
}

/// One message to deliver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub alert: Option<String>,
    #[serde(default)]
    pub badge: Option<u32>,
    #[serde(default)]
    pub sound: Option<String>,
    /// Additional top-level payload fields, merged beside the reserved
    /// `aps` object.
    #[serde(default)]
    pub extra: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// One feedback-service record: when the gateway decided the token was
/// stale, and the token in hex form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleToken {
    pub timestamp: DateTime<Utc>,
    pub token: String,
}

/// Persistence signals produced by one dispatch.
///
/// `notified` devices carry an updated `last_notified_at`; `dropped` devices
/// are the ones the gateway rejected by closing the connection; `invalid`
/// devices had tokens that could not be framed at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub notified: Vec<Device>,
    pub dropped: Vec<Device>,
    pub invalid: Vec<Device>,
    pub sent_at: DateTime<Utc>,
}
