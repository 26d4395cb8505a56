pub mod config;
pub mod types;

pub use config::{ServiceConfig, TimeoutConfig, FEEDBACK_PORT, PUSH_PORT};
pub use types::{Device, DispatchResult, Notification, StaleToken};
