//! Client for the legacy binary push protocol: mutual-TLS connections to the
//! push gateway, batched fault-tolerant dispatch, and the companion feedback
//! service client.

pub mod connection;
pub mod dispatch;
pub mod feedback;
pub mod payload;

pub use connection::{ConnectionError, ReadOutcome, TlsConnection, TlsConnector};
pub use dispatch::{
    DispatchError, PushConnector, PushDispatcher, PushTransport, TlsPushConnector,
    DEFAULT_CHUNK_SIZE,
};
pub use feedback::{deactivate_stale, FeedbackClient, FeedbackError, FEEDBACK_RECORD_LEN};
pub use payload::{
    build_payload, frame_message, is_valid_length, PayloadError, FRAME_OVERHEAD,
    MAX_PAYLOAD_BYTES, TOKEN_LEN,
};
