use anyhow::{Context, Result};
use chrono::Utc;

use apns_core::{Device, Notification, ServiceConfig, TimeoutConfig};
use apns_push::{deactivate_stale, DispatchError, FeedbackClient, FeedbackError, PushDispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting APNs runner");

    let service = ServiceConfig::from_env()?;
    let timeouts = TimeoutConfig::from_env();

    let devices_path = std::env::var("APNS_DEVICES_FILE")
        .context("APNS_DEVICES_FILE must point to a JSON device list")?;
    let raw = std::fs::read_to_string(&devices_path)
        .with_context(|| format!("Failed to read {}", devices_path))?;
    let mut devices: Vec<Device> =
        serde_json::from_str(&raw).context("Device list is not valid JSON")?;
    tracing::info!("Loaded {} devices from {}", devices.len(), devices_path);

    let mut notification = notification_from_env();
    if notification.alert.is_some()
        || notification.badge.is_some()
        || notification.sound.is_some()
    {
        let mut dispatcher = PushDispatcher::new(&service, timeouts)?;
        if let Some(size) = std::env::var("APNS_CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            dispatcher = dispatcher.with_chunk_size(size)?;
        }
        match dispatcher.push(&mut notification, &devices).await {
            Ok(result) => {
                tracing::info!(
                    "Dispatch done: {} notified, {} dropped, {} invalid",
                    result.notified.len(),
                    result.dropped.len(),
                    result.invalid.len()
                );
                apply_notified(&mut devices, &result.notified);
            }
            Err(DispatchError::Aborted { partial, source }) => {
                tracing::error!(
                    "Dispatch aborted ({}); keeping {} deliveries made before the fault",
                    source,
                    partial.notified.len()
                );
                apply_notified(&mut devices, &partial.notified);
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        tracing::info!("No notification fields set; skipping dispatch");
    }

    let feedback = FeedbackClient::new(&service, timeouts)?;
    match feedback.fetch_stale_tokens().await {
        Ok(stale) => {
            let changed = deactivate_stale(&mut devices, &stale, Utc::now());
            tracing::info!(
                "Feedback poll: {} stale tokens, {} devices deactivated",
                stale.len(),
                changed
            );
        }
        Err(FeedbackError::Transport { collected, source }) => {
            tracing::warn!(
                "Feedback stream failed ({}); applying {} tokens collected before the fault",
                source,
                collected.len()
            );
            deactivate_stale(&mut devices, &collected, Utc::now());
        }
        Err(e) => return Err(e.into()),
    }

    // The dispatch already happened; a read-only device file is not worth
    // failing the run over.
    let updated = serde_json::to_string_pretty(&devices)?;
    match std::fs::write(&devices_path, updated) {
        Ok(()) => tracing::info!("Wrote updated device list to {}", devices_path),
        Err(e) => tracing::warn!("Could not write device list to {}: {}", devices_path, e),
    }

    Ok(())
}

fn notification_from_env() -> Notification {
    Notification {
        alert: std::env::var("APNS_ALERT").ok(),
        badge: std::env::var("APNS_BADGE").ok().and_then(|v| v.parse().ok()),
        sound: std::env::var("APNS_SOUND").ok(),
        extra: None,
        last_sent_at: None,
    }
}

fn apply_notified(devices: &mut [Device], notified: &[Device]) {
    for device in devices.iter_mut() {
        if let Some(updated) = notified.iter().find(|n| n.token == device.token) {
            device.last_notified_at = updated.last_notified_at;
        }
    }
}
