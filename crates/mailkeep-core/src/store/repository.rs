//! Local replica storage repository.
//!
//! Single source of truth for the local side: messages, attachment
//! metadata, mailbox checkpoints, sync locks, and the pending mutation
//! queue all live in one `SQLite` database. Storage failures propagate to
//! the caller uninterpreted; nothing is silently suppressed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use super::model::{
    AttachmentMeta, CachedMessage, LockRecord, MailboxCheckpoint, PendingMutation,
};
use crate::queue::MutationKind;
use crate::{Error, Result};

/// Repository over the local replica database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema
    /// creation fails.
    pub async fn open(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema
    /// creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT NOT NULL DEFAULT '',
                internal_date TEXT NOT NULL,
                from_addr TEXT NOT NULL DEFAULT '',
                reply_to TEXT NOT NULL DEFAULT '',
                to_addr TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                date TEXT NOT NULL DEFAULT '',
                snippet TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                unread INTEGER NOT NULL DEFAULT 1,
                references_hdr TEXT NOT NULL DEFAULT '',
                UNIQUE(account, mailbox, uid)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                part_id TEXT NOT NULL,
                filename TEXT NOT NULL DEFAULT '',
                content_type TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                encoding TEXT NOT NULL DEFAULT '',
                UNIQUE(account, mailbox, uid, part_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS mailbox_checkpoints (
                account TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid_validity INTEGER NOT NULL DEFAULT 0,
                last_sync TEXT NOT NULL,
                PRIMARY KEY (account, mailbox)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sync_locks (
                account TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                start_fingerprint TEXT NOT NULL DEFAULT '',
                acquired_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS pending_mutations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                last_error TEXT NOT NULL DEFAULT ''
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_messages_date
            ON messages(account, mailbox, internal_date DESC)
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_pending_account
            ON pending_mutations(account)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- messages -------------------------------------------------------

    /// Insert message metadata if no row exists for its key.
    ///
    /// Idempotent: an existing row only has its unread flag refreshed, so
    /// an already-prefetched body is never clobbered by a metadata-only
    /// refresh. Returns true if a new row was inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn insert_if_absent(&self, message: &CachedMessage) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r"SELECT 1 FROM messages WHERE account = ? AND mailbox = ? AND uid = ?",
        )
        .bind(&message.account)
        .bind(&message.mailbox)
        .bind(message.uid)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            sqlx::query(
                r"UPDATE messages SET unread = ? WHERE account = ? AND mailbox = ? AND uid = ?",
            )
            .bind(message.unread)
            .bind(&message.account)
            .bind(&message.mailbox)
            .bind(message.uid)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r"
            INSERT INTO messages
                (account, mailbox, uid, message_id, internal_date, from_addr, reply_to,
                 to_addr, subject, date, snippet, body, unread, references_hdr)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&message.account)
        .bind(&message.mailbox)
        .bind(message.uid)
        .bind(&message.message_id)
        .bind(message.internal_date.to_rfc3339())
        .bind(&message.from)
        .bind(&message.reply_to)
        .bind(&message.to)
        .bind(&message.subject)
        .bind(message.date.to_rfc3339())
        .bind(&message.snippet)
        .bind(&message.body)
        .bind(message.unread)
        .bind(&message.references)
        .execute(&mut *tx)
        .await?;

        for att in &message.attachments {
            sqlx::query(
                r"
                INSERT INTO attachments
                    (account, mailbox, uid, part_id, filename, content_type, size, encoding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(account, mailbox, uid, part_id) DO NOTHING
                ",
            )
            .bind(&message.account)
            .bind(&message.mailbox)
            .bind(message.uid)
            .bind(&att.part_id)
            .bind(&att.filename)
            .bind(&att.content_type)
            .bind(att.size)
            .bind(&att.encoding)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Load a single message by UID, with its attachment metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_message(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
    ) -> Result<Option<CachedMessage>> {
        let row = sqlx::query(
            r"
            SELECT account, mailbox, uid, message_id, internal_date, from_addr, reply_to,
                   to_addr, subject, date, snippet, body, unread, references_hdr
            FROM messages
            WHERE account = ? AND mailbox = ? AND uid = ?
            ",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let Some(mut message) = message_from_row(&row) else {
            return Ok(None);
        };
        message.attachments = self.load_attachments(account, mailbox, uid).await?;
        Ok(Some(message))
    }

    /// List messages for a mailbox, newest first by receive time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_messages(
        &self,
        account: &str,
        mailbox: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CachedMessage>> {
        let rows = sqlx::query(
            r"
            SELECT account, mailbox, uid, message_id, internal_date, from_addr, reply_to,
                   to_addr, subject, date, snippet, body, unread, references_hdr
            FROM messages
            WHERE account = ? AND mailbox = ?
            ORDER BY internal_date DESC
            LIMIT ? OFFSET ?
            ",
        )
        .bind(account)
        .bind(mailbox)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(mut message) = message_from_row(row) {
                message.attachments = self
                    .load_attachments(account, mailbox, message.uid)
                    .await?;
                messages.push(message);
            }
        }
        Ok(messages)
    }

    async fn load_attachments(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
    ) -> Result<Vec<AttachmentMeta>> {
        let rows = sqlx::query(
            r"
            SELECT part_id, filename, content_type, size, encoding
            FROM attachments
            WHERE account = ? AND mailbox = ? AND uid = ?
            ORDER BY part_id ASC
            ",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid)
        .fetch_all(&self.pool)
        .await?;

        let attachments = rows
            .iter()
            .map(|row| AttachmentMeta {
                part_id: row.get("part_id"),
                filename: row.get("filename"),
                content_type: row.get("content_type"),
                size: row.get("size"),
                encoding: row.get("encoding"),
            })
            .collect();
        Ok(attachments)
    }

    /// Delete one message and its attachment metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_message(&self, account: &str, mailbox: &str, uid: u32) -> Result<()> {
        sqlx::query(r"DELETE FROM attachments WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(account)
            .bind(mailbox)
            .bind(uid)
            .execute(&self.pool)
            .await?;

        sqlx::query(r"DELETE FROM messages WHERE account = ? AND mailbox = ? AND uid = ?")
            .bind(account)
            .bind(mailbox)
            .bind(uid)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// The set of UIDs currently cached for a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn cached_uids(&self, account: &str, mailbox: &str) -> Result<HashSet<u32>> {
        let rows = sqlx::query(r"SELECT uid FROM messages WHERE account = ? AND mailbox = ?")
            .bind(account)
            .bind(mailbox)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get::<u32, _>("uid")).collect())
    }

    /// Compare the full remote UID set against the cache.
    ///
    /// Returns `(missing, stale)`: UIDs present remotely but not cached,
    /// and UIDs cached but absent remotely.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn diff_uids(
        &self,
        account: &str,
        mailbox: &str,
        remote_uids: &HashSet<u32>,
    ) -> Result<(Vec<u32>, Vec<u32>)> {
        let cached = self.cached_uids(account, mailbox).await?;

        let missing = remote_uids.difference(&cached).copied().collect();
        let stale = cached.difference(remote_uids).copied().collect();
        Ok((missing, stale))
    }

    /// Remove every message for a mailbox.
    ///
    /// Used on generation-identifier mismatch, when every cached UID for
    /// the mailbox has become meaningless.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn purge_mailbox(&self, account: &str, mailbox: &str) -> Result<()> {
        sqlx::query(r"DELETE FROM attachments WHERE account = ? AND mailbox = ?")
            .bind(account)
            .bind(mailbox)
            .execute(&self.pool)
            .await?;

        sqlx::query(r"DELETE FROM messages WHERE account = ? AND mailbox = ?")
            .bind(account)
            .bind(mailbox)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete cached messages received before `horizon`, except UIDs in
    /// `keep`.
    ///
    /// Returns the number of messages deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn prune_older_than(
        &self,
        account: &str,
        mailbox: &str,
        horizon: DateTime<Utc>,
        keep: &HashSet<u32>,
    ) -> Result<u64> {
        let rows = sqlx::query(
            r"SELECT uid FROM messages WHERE account = ? AND mailbox = ? AND internal_date < ?",
        )
        .bind(account)
        .bind(mailbox)
        .bind(horizon.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut deleted = 0;
        for row in &rows {
            let uid: u32 = row.get("uid");
            if keep.contains(&uid) {
                continue;
            }
            self.delete_message(account, mailbox, uid).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Store fetched body content for a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_body(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        body: &str,
        snippet: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE messages SET body = ?, snippet = ?
            WHERE account = ? AND mailbox = ? AND uid = ?
            ",
        )
        .bind(body)
        .bind(snippet)
        .bind(account)
        .bind(mailbox)
        .bind(uid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update only the unread flag of a cached message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_unread(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        unread: bool,
    ) -> Result<()> {
        sqlx::query(
            r"UPDATE messages SET unread = ? WHERE account = ? AND mailbox = ? AND uid = ?",
        )
        .bind(unread)
        .bind(account)
        .bind(mailbox)
        .bind(uid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// UIDs of the most recent messages with no cached body, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn uids_missing_body(
        &self,
        account: &str,
        mailbox: &str,
        limit: i64,
    ) -> Result<Vec<u32>> {
        let rows = sqlx::query(
            r"
            SELECT uid FROM messages
            WHERE account = ? AND mailbox = ? AND body = ''
            ORDER BY internal_date DESC
            LIMIT ?
            ",
        )
        .bind(account)
        .bind(mailbox)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<u32, _>("uid")).collect())
    }

    /// Number of messages cached for a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count_messages(&self, account: &str, mailbox: &str) -> Result<i64> {
        let row = sqlx::query(
            r"SELECT COUNT(*) as count FROM messages WHERE account = ? AND mailbox = ?",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("count"))
    }

    // ---- checkpoints ----------------------------------------------------

    /// Load the sync checkpoint for a mailbox, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn load_checkpoint(
        &self,
        account: &str,
        mailbox: &str,
    ) -> Result<Option<MailboxCheckpoint>> {
        let row = sqlx::query(
            r"
            SELECT uid_validity, last_sync FROM mailbox_checkpoints
            WHERE account = ? AND mailbox = ?
            ",
        )
        .bind(account)
        .bind(mailbox)
        .fetch_optional(&self.pool)
        .await?;

        let checkpoint = row.and_then(|row| {
            let last_sync_str: String = row.get("last_sync");
            let last_sync = DateTime::parse_from_rfc3339(&last_sync_str)
                .ok()?
                .with_timezone(&Utc);

            Some(MailboxCheckpoint {
                uid_validity: row.get::<u32, _>("uid_validity"),
                last_sync,
            })
        });

        Ok(checkpoint)
    }

    /// Save the sync checkpoint for a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn save_checkpoint(
        &self,
        account: &str,
        mailbox: &str,
        checkpoint: &MailboxCheckpoint,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO mailbox_checkpoints (account, mailbox, uid_validity, last_sync)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account, mailbox) DO UPDATE SET
                uid_validity = excluded.uid_validity,
                last_sync = excluded.last_sync
            ",
        )
        .bind(account)
        .bind(mailbox)
        .bind(checkpoint.uid_validity)
        .bind(checkpoint.last_sync.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The most recent completed sync time across an account's mailboxes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn last_sync_for_account(&self, account: &str) -> Result<Option<DateTime<Utc>>> {
        let rows = sqlx::query(r"SELECT last_sync FROM mailbox_checkpoints WHERE account = ?")
            .bind(account)
            .fetch_all(&self.pool)
            .await?;

        let latest = rows
            .iter()
            .filter_map(|row| {
                let raw: String = row.get("last_sync");
                DateTime::parse_from_rfc3339(&raw)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
            .max();
        Ok(latest)
    }

    // ---- sync locks -----------------------------------------------------

    /// Read the lock record for an account, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn lock_record(&self, account: &str) -> Result<Option<LockRecord>> {
        let row = sqlx::query(
            r"SELECT pid, start_fingerprint, acquired_at FROM sync_locks WHERE account = ?",
        )
        .bind(account)
        .fetch_optional(&self.pool)
        .await?;

        let record = row.and_then(|row| {
            let acquired_at_str: String = row.get("acquired_at");
            let acquired_at = DateTime::parse_from_rfc3339(&acquired_at_str)
                .ok()?
                .with_timezone(&Utc);

            Some(LockRecord {
                pid: row.get::<u32, _>("pid"),
                start_fingerprint: row.get("start_fingerprint"),
                acquired_at,
            })
        });

        Ok(record)
    }

    /// Atomically insert a lock record unless one already exists.
    ///
    /// Returns true if the record was written (lock acquired).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn try_insert_lock(&self, account: &str, record: &LockRecord) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO sync_locks (account, pid, start_fingerprint, acquired_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account) DO NOTHING
            ",
        )
        .bind(account)
        .bind(record.pid)
        .bind(&record.start_fingerprint)
        .bind(record.acquired_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete the lock record for an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_lock(&self, account: &str) -> Result<()> {
        sqlx::query(r"DELETE FROM sync_locks WHERE account = ?")
            .bind(account)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete a lock record only if it still names the observed holder.
    ///
    /// Guards stale-lock cleanup against racing a freshly written record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_lock_if_holder(
        &self,
        account: &str,
        pid: u32,
        start_fingerprint: &str,
    ) -> Result<()> {
        sqlx::query(
            r"DELETE FROM sync_locks WHERE account = ? AND pid = ? AND start_fingerprint = ?",
        )
        .bind(account)
        .bind(pid)
        .bind(start_fingerprint)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- pending mutations ----------------------------------------------

    /// Durably enqueue a mutation. Returns its queue id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn enqueue_mutation(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        kind: MutationKind,
    ) -> Result<i64> {
        let result = sqlx::query(
            r"
            INSERT INTO pending_mutations (account, mailbox, uid, kind, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(account)
        .bind(mailbox)
        .bind(uid)
        .bind(kind.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Pending mutations for an account, in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a stored kind is
    /// unknown.
    pub async fn pending_for_account(&self, account: &str) -> Result<Vec<PendingMutation>> {
        let rows = sqlx::query(
            r"
            SELECT id, account, mailbox, uid, kind, created_at, retries, last_error
            FROM pending_mutations
            WHERE account = ?
            ORDER BY created_at ASC, id ASC
            ",
        )
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        let mut mutations = Vec::with_capacity(rows.len());
        for row in &rows {
            let kind_str: String = row.get("kind");
            let kind = MutationKind::parse(&kind_str)
                .ok_or_else(|| Error::UnknownMutationKind(kind_str.clone()))?;

            let created_at_str: String = row.get("created_at");
            let created_at = DateTime::parse_from_rfc3339(&created_at_str)
                .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc));

            mutations.push(PendingMutation {
                id: row.get("id"),
                account: row.get("account"),
                mailbox: row.get("mailbox"),
                uid: row.get::<u32, _>("uid"),
                kind,
                created_at,
                retries: row.get("retries"),
                last_error: row.get("last_error"),
            });
        }
        Ok(mutations)
    }

    /// Remove a confirmed mutation from the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove_mutation(&self, id: i64) -> Result<()> {
        sqlx::query(r"DELETE FROM pending_mutations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record a failed attempt: bump the retry count and keep the entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn record_mutation_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r"UPDATE pending_mutations SET retries = retries + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of pending mutations for an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn pending_count(&self, account: &str) -> Result<i64> {
        let row =
            sqlx::query(r"SELECT COUNT(*) as count FROM pending_mutations WHERE account = ?")
                .bind(account)
                .fetch_one(&self.pool)
                .await?;

        Ok(row.get("count"))
    }
}

fn message_from_row(row: &SqliteRow) -> Option<CachedMessage> {
    let internal_date_str: String = row.get("internal_date");
    let internal_date = DateTime::parse_from_rfc3339(&internal_date_str)
        .ok()?
        .with_timezone(&Utc);

    let date_str: String = row.get("date");
    let date = DateTime::parse_from_rfc3339(&date_str)
        .map_or(internal_date, |dt| dt.with_timezone(&Utc));

    Some(CachedMessage {
        account: row.get("account"),
        mailbox: row.get("mailbox"),
        uid: row.get::<u32, _>("uid"),
        message_id: row.get("message_id"),
        internal_date,
        from: row.get("from_addr"),
        reply_to: row.get("reply_to"),
        to: row.get("to_addr"),
        subject: row.get("subject"),
        date,
        snippet: row.get("snippet"),
        body: row.get("body"),
        unread: row.get::<bool, _>("unread"),
        references: row.get("references_hdr"),
        attachments: Vec::new(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn message(account: &str, mailbox: &str, uid: u32, age_days: i64) -> CachedMessage {
        CachedMessage {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid,
            message_id: format!("<{uid}@example.com>"),
            internal_date: Utc::now() - Duration::days(age_days),
            from: "sender@example.com".to_string(),
            reply_to: String::new(),
            to: "me@example.com".to_string(),
            subject: format!("Message {uid}"),
            date: Utc::now() - Duration::days(age_days),
            snippet: "preview...".to_string(),
            body: String::new(),
            unread: true,
            references: String::new(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_message() {
        let store = Store::in_memory().await.unwrap();

        let mut msg = message("a@example.com", "INBOX", 1, 0);
        msg.attachments.push(AttachmentMeta {
            part_id: "2".to_string(),
            filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: 1024,
            encoding: "base64".to_string(),
        });

        assert!(store.insert_if_absent(&msg).await.unwrap());

        let loaded = store
            .get_message("a@example.com", "INBOX", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.subject, "Message 1");
        assert_eq!(loaded.attachments.len(), 1);
        assert_eq!(loaded.attachments[0].filename, "report.pdf");
        assert!(!loaded.has_body());
    }

    #[tokio::test]
    async fn test_insert_if_absent_never_clears_body() {
        let store = Store::in_memory().await.unwrap();

        let msg = message("a@example.com", "INBOX", 1, 0);
        assert!(store.insert_if_absent(&msg).await.unwrap());
        store
            .update_body("a@example.com", "INBOX", 1, "<p>hello</p>", "hello")
            .await
            .unwrap();

        // A metadata-only refresh must not clobber the fetched body.
        assert!(!store.insert_if_absent(&msg).await.unwrap());

        let loaded = store
            .get_message("a@example.com", "INBOX", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.body, "<p>hello</p>");
        assert_eq!(loaded.snippet, "hello");
    }

    #[tokio::test]
    async fn test_insert_if_absent_refreshes_unread() {
        let store = Store::in_memory().await.unwrap();

        let mut msg = message("a@example.com", "INBOX", 1, 0);
        store.insert_if_absent(&msg).await.unwrap();

        msg.unread = false;
        store.insert_if_absent(&msg).await.unwrap();

        let loaded = store
            .get_message("a@example.com", "INBOX", 1)
            .await
            .unwrap()
            .unwrap();
        assert!(!loaded.unread);
    }

    #[tokio::test]
    async fn test_diff_uids() {
        let store = Store::in_memory().await.unwrap();

        for uid in 1..=10 {
            store
                .insert_if_absent(&message("a@example.com", "INBOX", uid, 0))
                .await
                .unwrap();
        }

        let remote: HashSet<u32> = (3..=12).collect();
        let (mut missing, mut stale) = store
            .diff_uids("a@example.com", "INBOX", &remote)
            .await
            .unwrap();
        missing.sort_unstable();
        stale.sort_unstable();

        assert_eq!(missing, vec![11, 12]);
        assert_eq!(stale, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_purge_mailbox_is_scoped() {
        let store = Store::in_memory().await.unwrap();

        store
            .insert_if_absent(&message("a@example.com", "INBOX", 1, 0))
            .await
            .unwrap();
        store
            .insert_if_absent(&message("a@example.com", "Archive", 1, 0))
            .await
            .unwrap();

        store.purge_mailbox("a@example.com", "INBOX").await.unwrap();

        assert_eq!(store.count_messages("a@example.com", "INBOX").await.unwrap(), 0);
        assert_eq!(
            store.count_messages("a@example.com", "Archive").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_prune_older_than_respects_keep_set() {
        let store = Store::in_memory().await.unwrap();

        store
            .insert_if_absent(&message("a@example.com", "INBOX", 1, 30))
            .await
            .unwrap();
        store
            .insert_if_absent(&message("a@example.com", "INBOX", 2, 30))
            .await
            .unwrap();
        store
            .insert_if_absent(&message("a@example.com", "INBOX", 3, 1))
            .await
            .unwrap();

        let horizon = Utc::now() - Duration::days(14);
        let keep: HashSet<u32> = [2].into_iter().collect();
        let deleted = store
            .prune_older_than("a@example.com", "INBOX", horizon, &keep)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        let uids = store.cached_uids("a@example.com", "INBOX").await.unwrap();
        assert!(!uids.contains(&1));
        assert!(uids.contains(&2));
        assert!(uids.contains(&3));
    }

    #[tokio::test]
    async fn test_list_messages_order_and_paging() {
        let store = Store::in_memory().await.unwrap();

        for (uid, age) in [(1, 3), (2, 1), (3, 2)] {
            store
                .insert_if_absent(&message("a@example.com", "INBOX", uid, age))
                .await
                .unwrap();
        }

        let page = store
            .list_messages("a@example.com", "INBOX", 2, 0)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![2, 3]);

        let rest = store
            .list_messages("a@example.com", "INBOX", 2, 2)
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let store = Store::in_memory().await.unwrap();

        assert!(
            store
                .load_checkpoint("a@example.com", "INBOX")
                .await
                .unwrap()
                .is_none()
        );

        let checkpoint = MailboxCheckpoint {
            uid_validity: 42,
            last_sync: Utc::now(),
        };
        store
            .save_checkpoint("a@example.com", "INBOX", &checkpoint)
            .await
            .unwrap();

        let loaded = store
            .load_checkpoint("a@example.com", "INBOX")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.uid_validity, 42);

        let last = store
            .last_sync_for_account("a@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!((last - checkpoint.last_sync).num_seconds().abs() < 2);
    }

    #[tokio::test]
    async fn test_lock_insert_is_exclusive() {
        let store = Store::in_memory().await.unwrap();

        let record = LockRecord {
            pid: 100,
            start_fingerprint: "boot-1".to_string(),
            acquired_at: Utc::now(),
        };
        assert!(store.try_insert_lock("a@example.com", &record).await.unwrap());
        assert!(!store.try_insert_lock("a@example.com", &record).await.unwrap());

        store.delete_lock("a@example.com").await.unwrap();
        assert!(store.try_insert_lock("a@example.com", &record).await.unwrap());
    }

    #[tokio::test]
    async fn test_mutation_queue_order_and_failure_tracking() {
        let store = Store::in_memory().await.unwrap();

        let first = store
            .enqueue_mutation("a@example.com", "INBOX", 1, MutationKind::Delete)
            .await
            .unwrap();
        store
            .enqueue_mutation("a@example.com", "INBOX", 2, MutationKind::MarkRead)
            .await
            .unwrap();

        let pending = store.pending_for_account("a@example.com").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].uid, 1);
        assert_eq!(pending[0].kind, MutationKind::Delete);
        assert_eq!(pending[1].uid, 2);

        store
            .record_mutation_failure(first, "connection refused")
            .await
            .unwrap();
        let pending = store.pending_for_account("a@example.com").await.unwrap();
        assert_eq!(pending[0].retries, 1);
        assert_eq!(pending[0].last_error, "connection refused");

        store.remove_mutation(first).await.unwrap();
        assert_eq!(store.pending_count("a@example.com").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mutation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailkeep.db");
        let path = path.to_string_lossy().to_string();

        {
            let store = Store::open(&path).await.unwrap();
            store
                .enqueue_mutation("a@example.com", "INBOX", 7, MutationKind::MoveToTrash)
                .await
                .unwrap();
        }

        // Simulated restart: a fresh handle sees the same durable entry.
        let store = Store::open(&path).await.unwrap();
        let pending = store.pending_for_account("a@example.com").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uid, 7);
        assert_eq!(pending[0].kind, MutationKind::MoveToTrash);
    }
}
