//! # mailkeep-core
//!
//! Core logic for the `mailkeep` background mail synchronizer.
//!
//! This crate provides:
//! - **Store** - the local `SQLite` replica of remote mailboxes (messages,
//!   attachment metadata, sync checkpoints, cross-process locks, and the
//!   durable mutation queue). The store is the single source of truth for
//!   the local side; there is no in-memory shadow cache.
//! - **Lock Manager** - per-account mutual exclusion that survives process
//!   crashes and restarts, using a process start-time fingerprint instead
//!   of a bare PID.
//! - **Reconciler** - the bounded-cost algorithm that brings the local
//!   replica in line with the remote mailbox in a single pass.
//! - **Mutation Queue** - a durable outbox for delete / move-to-trash /
//!   mark-read requests, drained against the remote with at-least-once
//!   semantics.
//! - **Remote interface** - the trait seam a concrete mail-protocol client
//!   plugs into; this crate never speaks the wire protocol itself.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod error;
pub mod lock;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
pub use lock::{LockManager, ProcessProbe, SystemProbe};
pub use queue::{DrainOutcome, MutationKind, drain_account};
pub use remote::{
    AttachmentOverview, FetchedBody, MailboxStatus, MessageOverview, RemoteConnector, RemoteError,
    RemoteMailbox, RemoteResult, UidEntry,
};
pub use store::{
    AttachmentMeta, CachedMessage, LockRecord, MailboxCheckpoint, PendingMutation, Store,
};
pub use sync::{PassSummary, Reconciler, SyncConfig};
