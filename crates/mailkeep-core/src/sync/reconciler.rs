//! The reconciliation pass.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::remote::{RemoteError, RemoteMailbox};
use crate::store::{CachedMessage, MailboxCheckpoint, Store};
use crate::Result;

/// Tunables for a reconciliation pass.
///
/// The union fetch strategy needs both knobs: a pure "last N" policy
/// silently drops recent mail in a high-volume mailbox, and a pure
/// "last T days" policy returns nothing useful for a sparse one.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Trailing recency window, in days. Doubles as the retention horizon.
    pub window_days: i64,
    /// Minimum number of most-recent messages to cache regardless of age.
    pub sequence_floor: u32,
    /// Maximum number of message bodies to prefetch per pass.
    pub prefetch_count: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_days: 14,
            sequence_floor: 100,
            prefetch_count: 10,
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassSummary {
    /// Previously-unseen messages inserted.
    pub inserted: u64,
    /// Cached UIDs removed because they vanished remotely.
    pub removed_stale: u64,
    /// Cached messages pruned by the retention horizon.
    pub pruned: u64,
    /// Bodies prefetched.
    pub bodies_fetched: u64,
    /// Whether a generation mismatch forced a full purge first.
    pub purged_generation: bool,
}

/// Runs reconciliation passes against a [`Store`].
pub struct Reconciler {
    store: Store,
    config: SyncConfig,
}

impl Reconciler {
    /// Create a reconciler with default tunables.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            config: SyncConfig::default(),
        }
    }

    /// Create a reconciler with explicit tunables.
    #[must_use]
    pub const fn with_config(store: Store, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Reconcile one mailbox against the remote in a single pass.
    ///
    /// Each step is independently idempotent: a remote failure aborts the
    /// pass and leaves every write made so far valid, so a retried pass is
    /// safe and cheap.
    ///
    /// # Errors
    ///
    /// Returns an error on any remote-protocol or storage failure; the
    /// caller retries on its next cycle.
    pub async fn sync_mailbox<R: RemoteMailbox>(
        &self,
        remote: &mut R,
        account: &str,
        mailbox: &str,
    ) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        let now = Utc::now();

        // Generation check: a changed identifier means every cached UID
        // for this mailbox is meaningless.
        let status = remote.mailbox_status(mailbox).await?;
        let checkpoint = self.store.load_checkpoint(account, mailbox).await?;
        let generation_matches =
            checkpoint.is_some_and(|c| c.uid_validity == status.uid_validity);
        if !generation_matches {
            if let Some(old) = checkpoint {
                warn!(
                    account,
                    mailbox,
                    old_generation = old.uid_validity,
                    new_generation = status.uid_validity,
                    "mailbox generation changed, purging cache"
                );
                summary.purged_generation = true;
            }
            self.store.purge_mailbox(account, mailbox).await?;
        }

        // Union fetch: sequence floor plus trailing time window.
        let mut overviews = remote
            .fetch_recent_overviews(mailbox, self.config.sequence_floor)
            .await?;
        let covered: HashSet<u32> = overviews.iter().map(|o| o.uid).collect();

        let since = now - Duration::days(self.config.window_days);
        let window_entries = remote.search_uids_since(mailbox, since).await?;
        let extra: Vec<u32> = window_entries
            .iter()
            .map(|e| e.uid)
            .filter(|uid| !covered.contains(uid))
            .collect();
        if !extra.is_empty() {
            overviews.extend(remote.fetch_overviews(mailbox, &extra).await?);
        }

        let union: HashSet<u32> = overviews.iter().map(|o| o.uid).collect();
        for overview in &overviews {
            let message = CachedMessage::from_overview(account, mailbox, overview);
            if self.store.insert_if_absent(&message).await? {
                summary.inserted += 1;
            }
        }

        // Stale removal against the full remote UID set, so deletions made
        // by other clients become invisible locally.
        let remote_uids: HashSet<u32> = remote.list_uids(mailbox).await?.into_iter().collect();
        let (_, stale) = self.store.diff_uids(account, mailbox, &remote_uids).await?;
        for uid in stale {
            self.store.delete_message(account, mailbox, uid).await?;
            summary.removed_stale += 1;
        }

        // Retention: bound local growth. Members of this pass's union stay
        // even when old, otherwise the sequence floor could never hold more
        // than the time window does.
        let horizon = now - Duration::days(self.config.window_days);
        summary.pruned = self
            .store
            .prune_older_than(account, mailbox, horizon, &union)
            .await?;

        summary.bodies_fetched = self.prefetch_bodies(remote, account, mailbox).await?;

        self.store
            .save_checkpoint(
                account,
                mailbox,
                &MailboxCheckpoint {
                    uid_validity: status.uid_validity,
                    last_sync: Utc::now(),
                },
            )
            .await?;

        info!(
            account,
            mailbox,
            inserted = summary.inserted,
            removed_stale = summary.removed_stale,
            pruned = summary.pruned,
            bodies = summary.bodies_fetched,
            "reconciliation pass complete"
        );
        Ok(summary)
    }

    /// Fetch bodies for the most recent messages that lack one.
    async fn prefetch_bodies<R: RemoteMailbox>(
        &self,
        remote: &mut R,
        account: &str,
        mailbox: &str,
    ) -> Result<u64> {
        let uids = self
            .store
            .uids_missing_body(account, mailbox, self.config.prefetch_count)
            .await?;

        let mut fetched = 0;
        for uid in uids {
            match remote.fetch_body(mailbox, uid).await {
                Ok(body) => {
                    self.store
                        .update_body(account, mailbox, uid, &body.body, &body.snippet)
                        .await?;
                    fetched += 1;
                }
                Err(RemoteError::NotFound) => {
                    // Vanished between the UID listing and the fetch.
                    debug!(account, mailbox, uid, "message gone before body prefetch");
                    self.store.delete_message(account, mailbox, uid).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(fetched)
    }
}
