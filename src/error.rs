//! Remote fit-control error types.
//!
//! # Error Classification
//!
//! Errors split by how far they are allowed to travel:
//!
//! | Error               | Session effect                          | Peer sees            |
//! |---------------------|-----------------------------------------|----------------------|
//! | `HandshakeFailed`   | connection closed, logged               | closed socket        |
//! | `MalformedFrame`    | cleanup, connection closed              | closed socket        |
//! | `ProtocolViolation` | cleanup, connection closed              | closed socket        |
//! | `SessionBusy`       | none                                    | in-band `Text` error |
//! | `NoModel`           | none                                    | in-band `Text` error |
//! | `TransportReset`    | treated as an implicit stop request     | (peer is gone)       |
//!
//! Transport errors are caught at the session boundary and turned into the
//! cleanup path. They never reach the optimizer thread.

use std::io;

use thiserror::Error;

/// Remote fit-control errors.
#[derive(Error, Debug)]
pub enum RemoteFitError {
    /// The peer did not present the expected challenge (or closed early).
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A frame had an unknown tag, a bad payload, or was truncated.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer sent a message it is not allowed to send.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The request conflicts with a running fit.
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// A fit was requested before any model was transferred.
    #[error("No model has been transferred")]
    NoModel,

    /// The peer vanished (reset, aborted, broken pipe).
    #[error("Transport reset: {0}")]
    TransportReset(String),

    /// The optimizer refused or failed an operation.
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for remote fit-control operations
pub type Result<T> = std::result::Result<T, RemoteFitError>;

impl RemoteFitError {
    /// Classify an I/O error raised while reading a frame or handshake token.
    ///
    /// A premature EOF means the peer stopped mid-unit, so the unit is
    /// malformed; a reset means the peer is gone.
    pub fn from_read(err: io::Error, context: &str) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => {
                Self::MalformedFrame(format!("{context}: stream closed early"))
            },
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::TransportReset(format!("{context}: {err}")),
            _ => Self::Io(err),
        }
    }

    /// Whether the error only needs to be reported in-band to the peer.
    ///
    /// Covers refused requests: a busy session, a missing model, or an
    /// optimizer rejecting a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SessionBusy(_) | Self::NoModel | Self::Optimizer(_))
    }

    /// Whether the error means the peer disconnected.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::TransportReset(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for RemoteFitError {
    fn from(err: toml::de::Error) -> Self {
        RemoteFitError::Config(err.to_string())
    }
}
