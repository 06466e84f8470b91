//! Error types for the adapter control channel

use std::{io::Error as IoError, net::SocketAddr, time::Duration};
use thiserror::Error;

/// Reasons a single inbound line could not be decoded as a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("frame is missing a '_' separator: {0:?}")]
    MissingSeparator(String),

    #[error("invalid frame name {0:?}")]
    InvalidName(String),

    #[error("invalid frame correlator {0:?}")]
    InvalidCorrelator(String),

    #[error("frame exceeds {0} bytes without a newline")]
    TooLong(usize),
}

/// Failures of a control-channel call.
///
/// Protocol failures are scoped to the call that observes them; the socket
/// and every other pending call are unaffected.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to connect to adapter plugin at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: IoError,
    },

    #[error("Adapter I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Action '{action}' for invoker {invoker_id} timed out after {timeout:?}")]
    Timeout {
        action: String,
        invoker_id: u64,
        timeout: Duration,
    },

    #[error("Action '{action}' for invoker {invoker_id} is already in flight")]
    CallInFlight { action: String, invoker_id: u64 },

    #[error("Adapter connection closed")]
    Closed,

    #[error("Unexpected payload for '{action}': {source}")]
    UnexpectedPayload {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type AdapterResult<T> = Result<T, AdapterError>;
