use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Well-known push gateway port.
pub const PUSH_PORT: u16 = 2195;
/// Well-known feedback service port.
pub const FEEDBACK_PORT: u16 = 2196;

const PRODUCTION_PUSH_HOST: &str = "gateway.push.apple.com";
const PRODUCTION_FEEDBACK_HOST: &str = "feedback.push.apple.com";
const SANDBOX_PUSH_HOST: &str = "gateway.sandbox.push.apple.com";
const SANDBOX_FEEDBACK_HOST: &str = "feedback.sandbox.push.apple.com";

/// One push gateway endpoint and its client credentials.
///
/// The certificate and private key are PEM text, loaded once by the
/// configuration layer. The core never mutates a `ServiceConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub feedback_hostname: String,
    pub feedback_port: u16,
    /// PEM-encoded client certificate chain.
    pub certificate: String,
    /// PEM-encoded private key, possibly an `ENCRYPTED PRIVATE KEY` block.
    pub private_key: String,
    /// Passphrase for an encrypted private key.
    pub passphrase: Option<String>,
    /// PEM trust anchor override. When unset the system roots are used.
    pub ca_certificate: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let sandbox = env::var("APNS_SANDBOX")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let (push_host, feedback_host) = if sandbox {
            (SANDBOX_PUSH_HOST, SANDBOX_FEEDBACK_HOST)
        } else {
            (PRODUCTION_PUSH_HOST, PRODUCTION_FEEDBACK_HOST)
        };

        let config = ServiceConfig {
            name: env::var("APNS_SERVICE_NAME").unwrap_or_else(|_| "default".to_string()),
            hostname: env::var("APNS_HOST").unwrap_or_else(|_| push_host.to_string()),
            port: env::var("APNS_PORT")
                .unwrap_or_else(|_| PUSH_PORT.to_string())
                .parse()
                .unwrap_or(PUSH_PORT),
            feedback_hostname: env::var("APNS_FEEDBACK_HOST")
                .unwrap_or_else(|_| feedback_host.to_string()),
            feedback_port: env::var("APNS_FEEDBACK_PORT")
                .unwrap_or_else(|_| FEEDBACK_PORT.to_string())
                .parse()
                .unwrap_or(FEEDBACK_PORT),
            certificate: read_pem_file("APNS_CERT_PATH")?,
            private_key: read_pem_file("APNS_KEY_PATH")?,
            passphrase: env::var("APNS_PASSPHRASE").ok(),
            ca_certificate: match env::var("APNS_CA_PATH") {
                Ok(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read CA certificate {}", path))?,
                ),
                Err(_) => None,
            },
        };

        tracing::info!(
            "Loaded service {} (push {}:{}, feedback {}:{})",
            config.name,
            config.hostname,
            config.port,
            config.feedback_hostname,
            config.feedback_port
        );
        Ok(config)
    }
}

fn read_pem_file(var: &str) -> Result<String> {
    let path = env::var(var).with_context(|| format!("{} must be set", var))?;
    std::fs::read_to_string(&path).with_context(|| format!("Failed to read {} ({})", path, var))
}

/// Per-operation deadlines for gateway connections.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub write: Duration,
    pub read: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            connect: Duration::from_secs(10),
            write: Duration::from_secs(10),
            read: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    pub fn from_env() -> Self {
        let defaults = TimeoutConfig::default();
        TimeoutConfig {
            connect: duration_from_env("APNS_CONNECT_TIMEOUT_SECS", defaults.connect),
            write: duration_from_env("APNS_WRITE_TIMEOUT_SECS", defaults.write),
            read: duration_from_env("APNS_READ_TIMEOUT_SECS", defaults.read),
        }
    }
}

fn duration_from_env(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.connect, Duration::from_secs(10));
        assert_eq!(timeouts.write, Duration::from_secs(10));
        assert_eq!(timeouts.read, Duration::from_secs(30));
    }
}
