//! Error types for the daemon crate.

use thiserror::Error;

/// Errors that can occur in daemon operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Core storage or sync operation failed.
    #[error(transparent)]
    Core(#[from] mailkeep_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The identity file contents could not be parsed.
    #[error("Malformed daemon identity record: {0}")]
    MalformedIdentity(String),

    /// A live daemon of the same version already runs for this user.
    #[error("Daemon already running with PID {0}")]
    AlreadyRunning(u32),

    /// The server reported a failure over IPC.
    #[error("Daemon reported an error: {0}")]
    Ipc(String),

    /// The server sent a response that does not answer the request.
    #[error("Unexpected IPC response: {0}")]
    UnexpectedResponse(String),

    /// The IPC connection was closed before a response arrived.
    #[error("Connection closed by daemon")]
    ConnectionClosed,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
