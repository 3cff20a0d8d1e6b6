//! Error types for pane-mcp.

use serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use thiserror::Error;

/// Main error type for pane-mcp operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Terminal host unreachable, or the connection could not be re-established
    #[error("Connection error: {0}")]
    Connection(String),

    /// The requested session (pane) does not exist on the host
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A delivery strategy failed to place text into a session
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Waiting for a busy session exceeded the deadline, in seconds
    #[error("Timeout after {0}s waiting for the session")]
    Timeout(u64),

    /// The host answered, but with something we could not use
    #[error("Host error: {0}")]
    Host(String),

    /// Invalid input or parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// The coarse category reported to clients in a failed `Response`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) | Error::SessionNotFound(_) => ErrorKind::Connection,
            Error::Delivery(_) => ErrorKind::Delivery,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidInput(_) | Error::Config(_) => ErrorKind::InvalidInput,
            Error::Host(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Error category as seen by automation clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Host unreachable or session invalid
    Connection,
    /// Text could not be delivered
    Delivery,
    /// Deadline exceeded
    Timeout,
    /// Bad request
    InvalidInput,
    /// Anything else
    Internal,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
