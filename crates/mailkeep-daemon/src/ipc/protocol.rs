//! IPC wire shapes.
//!
//! One request and one response per line, each a JSON object tagged with
//! a `type` field. The shapes are versioned implicitly through the
//! `Hello` exchange: client and daemon trade version strings and the
//! client decides whether to proceed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailkeep_core::{CachedMessage, MutationKind};

/// Client-to-daemon requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Version handshake.
    Hello {
        /// Client's version tag.
        version: String,
    },
    /// Liveness check.
    Ping,
    /// Read cached messages; never touches the remote side.
    GetMessages {
        /// Target account.
        account: String,
        /// Target mailbox.
        mailbox: String,
        /// Page size.
        limit: i64,
        /// Page start.
        offset: i64,
    },
    /// Read one message with its body, fetching the body on demand if it
    /// is not cached yet.
    GetMessageBody {
        /// Target account.
        account: String,
        /// Target mailbox.
        mailbox: String,
        /// Target UID.
        uid: u32,
    },
    /// Ask for an out-of-cycle reconciliation pass.
    RequestSync {
        /// Target account.
        account: String,
    },
    /// Durably enqueue a state-changing operation.
    SubmitMutation {
        /// Target account.
        account: String,
        /// Target mailbox.
        mailbox: String,
        /// Target UID.
        uid: u32,
        /// Operation kind.
        kind: MutationKind,
    },
    /// Read sync status for an account.
    GetStatus {
        /// Target account.
        account: String,
    },
    /// Ask the daemon to shut down.
    Shutdown,
}

/// Daemon-to-client responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Version handshake answer.
    Hello {
        /// Daemon's version tag.
        version: String,
    },
    /// Liveness answer.
    Pong,
    /// A page of cached messages.
    Messages {
        /// The page, newest first.
        messages: Vec<CachedMessage>,
    },
    /// One message with body content.
    MessageBody {
        /// The message.
        message: CachedMessage,
    },
    /// The requested message no longer exists remotely; its cached copy
    /// has been purged and the client should drop it from its view.
    Gone,
    /// The sync request was queued.
    SyncAccepted,
    /// A pass for that account is already in flight.
    SyncBusy,
    /// The mutation is durably queued.
    MutationAccepted {
        /// Queue id of the entry.
        id: i64,
    },
    /// Sync status for an account.
    Status {
        /// When the account last completed a reconciliation pass.
        last_sync: Option<DateTime<Utc>>,
        /// Mutations still waiting for remote confirmation.
        pending_mutations: i64,
    },
    /// Shutdown acknowledged.
    ShuttingDown,
    /// The request failed.
    Error {
        /// Human-readable failure description.
        message: String,
    },
}
