//! Error types for the core library.

use thiserror::Error;

use crate::remote::RemoteError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote-protocol operation failed.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Account not found in the configuration.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Unknown mutation kind read back from storage.
    #[error("Unknown mutation kind: {0}")]
    UnknownMutationKind(String),
}

impl Error {
    /// Returns true if this error means the remote object no longer exists.
    ///
    /// Read paths use this to purge the stale local copy and report a
    /// "gone" outcome instead of a generic failure.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::NotFound))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
