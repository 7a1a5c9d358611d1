//! Durable mutation queue.
//!
//! State-changing requests (delete, move to trash, mark read) are applied
//! to the local replica immediately and enqueued here; a drain pass
//! replays them against the remote side in enqueue order. Entries are
//! removed only after remote confirmation, so a crash between enqueue and
//! confirmation re-delivers: at-least-once, never silently dropped.

use tracing::{debug, warn};

use crate::remote::RemoteMailbox;
use crate::store::Store;
use crate::Result;

/// The kinds of remote mutation the queue can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Permanently delete the message.
    Delete,
    /// Move the message to the trash mailbox.
    MoveToTrash,
    /// Mark the message as read.
    MarkRead,
}

impl MutationKind {
    /// Stable string form used in storage and on the IPC wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::MoveToTrash => "move_trash",
            Self::MarkRead => "mark_read",
        }
    }

    /// Parse the stable string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delete" => Some(Self::Delete),
            "move_trash" => Some(Self::MoveToTrash),
            "mark_read" => Some(Self::MarkRead),
            _ => None,
        }
    }
}

impl serde::Serialize for MutationKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for MutationKind {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown mutation kind: {raw}")))
    }
}

/// Result of one drain pass over an account's queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainOutcome {
    /// Entries confirmed by the remote and removed from the queue.
    pub processed: u64,
    /// Entries that failed this pass and remain queued for retry.
    pub failed: u64,
}

/// Replay every pending mutation for an account against the remote.
///
/// Entries are attempted in enqueue order. A failed entry stays queued
/// with its retry count bumped and the pass moves on to the next one;
/// nothing is ever dropped on failure.
///
/// # Errors
///
/// Returns an error if reading or updating the queue itself fails.
/// Remote failures are recorded per entry, not propagated.
pub async fn drain_account<R: RemoteMailbox>(
    store: &Store,
    remote: &mut R,
    account: &str,
) -> Result<DrainOutcome> {
    let pending = store.pending_for_account(account).await?;
    if pending.is_empty() {
        return Ok(DrainOutcome::default());
    }
    debug!(account, count = pending.len(), "draining pending mutations");

    let mut outcome = DrainOutcome::default();
    for entry in pending {
        let result = match entry.kind {
            MutationKind::Delete => remote.delete(&entry.mailbox, entry.uid).await,
            MutationKind::MoveToTrash => remote.move_to_trash(&entry.mailbox, entry.uid).await,
            MutationKind::MarkRead => remote.mark_read(&entry.mailbox, entry.uid).await,
        };

        match result {
            Ok(()) => {
                store.remove_mutation(entry.id).await?;
                // The remote confirmed removal; drop any cached copy that a
                // sync pass re-created in the meantime.
                if matches!(entry.kind, MutationKind::Delete | MutationKind::MoveToTrash) {
                    store
                        .delete_message(&entry.account, &entry.mailbox, entry.uid)
                        .await?;
                }
                outcome.processed += 1;
            }
            Err(err) => {
                warn!(
                    account,
                    mailbox = entry.mailbox,
                    uid = entry.uid,
                    kind = entry.kind.as_str(),
                    retries = entry.retries + 1,
                    error = %err,
                    "pending mutation failed, will retry"
                );
                store
                    .record_mutation_failure(entry.id, &err.to_string())
                    .await?;
                outcome.failed += 1;
            }
        }
    }

    Ok(outcome)
}
