//! Store data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::MutationKind;
use crate::remote::MessageOverview;

/// One cached mail item, keyed by `(account, mailbox, uid)`.
///
/// A message may exist with metadata only; `body` is empty until the
/// prefetch step or an on-demand fetch populates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMessage {
    /// Account the message belongs to.
    pub account: String,
    /// Mailbox the message lives in.
    pub mailbox: String,
    /// Remote-assigned UID, unique within one mailbox generation.
    pub uid: u32,
    /// Stable cross-mailbox message identifier (may be empty).
    pub message_id: String,
    /// Server receive time; authoritative for ordering and retention.
    pub internal_date: DateTime<Utc>,
    /// Sender address.
    pub from: String,
    /// Reply-To address (may be empty).
    pub reply_to: String,
    /// Recipient addresses.
    pub to: String,
    /// Message subject.
    pub subject: String,
    /// Date header as sent.
    pub date: DateTime<Utc>,
    /// Preview snippet.
    pub snippet: String,
    /// Full body content; empty until fetched.
    pub body: String,
    /// Whether the message is unread.
    pub unread: bool,
    /// References header for threading (may be empty).
    pub references: String,
    /// Attachment metadata owned by this message.
    pub attachments: Vec<AttachmentMeta>,
}

impl CachedMessage {
    /// Builds a metadata-only cached message from a remote overview.
    #[must_use]
    pub fn from_overview(account: &str, mailbox: &str, overview: &MessageOverview) -> Self {
        Self {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid: overview.uid,
            message_id: overview.message_id.clone(),
            internal_date: overview.internal_date,
            from: overview.from.clone(),
            reply_to: overview.reply_to.clone(),
            to: overview.to.clone(),
            subject: overview.subject.clone(),
            date: overview.date,
            snippet: overview.snippet.clone(),
            body: String::new(),
            unread: overview.unread,
            references: overview.references.clone(),
            attachments: overview
                .attachments
                .iter()
                .map(|a| AttachmentMeta {
                    part_id: a.part_id.clone(),
                    filename: a.filename.clone(),
                    content_type: a.content_type.clone(),
                    size: a.size,
                    encoding: a.encoding.clone(),
                })
                .collect(),
        }
    }

    /// Returns true if body content has been fetched for this message.
    #[must_use]
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}

/// Attachment metadata owned by exactly one cached message.
///
/// Content bytes are never cached; they are fetched on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// MIME part identifier.
    pub part_id: String,
    /// Attachment filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Size in bytes.
    pub size: i64,
    /// Transfer encoding.
    pub encoding: String,
}

/// Sync checkpoint for one `(account, mailbox)`.
#[derive(Debug, Clone, Copy)]
pub struct MailboxCheckpoint {
    /// Generation identifier (UIDVALIDITY) observed at the last sync.
    pub uid_validity: u32,
    /// When the last reconciliation pass completed.
    pub last_sync: DateTime<Utc>,
}

/// Persisted sync lock for one account.
#[derive(Debug, Clone)]
pub struct LockRecord {
    /// Holder's process identifier.
    pub pid: u32,
    /// Holder's process start-time fingerprint; empty if unobtainable.
    pub start_fingerprint: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// A durably queued, not-yet-confirmed state-changing request destined
/// for the remote side.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    /// Surrogate queue id.
    pub id: i64,
    /// Target account.
    pub account: String,
    /// Target mailbox.
    pub mailbox: String,
    /// Target UID.
    pub uid: u32,
    /// Operation kind.
    pub kind: MutationKind,
    /// When the mutation was enqueued.
    pub created_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub retries: i64,
    /// Error text from the most recent failed attempt (empty if none).
    pub last_error: String,
}
