//! Local replica storage.
//!
//! One `SQLite` database holds everything the local side knows: cached
//! messages, attachment metadata, per-mailbox sync checkpoints, the
//! cross-process sync locks, and the durable mutation queue.

mod model;
mod repository;

pub use model::{AttachmentMeta, CachedMessage, LockRecord, MailboxCheckpoint, PendingMutation};
pub use repository::Store;
