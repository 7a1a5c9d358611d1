//! Interface to the remote mail-protocol client.
//!
//! The reconciler and the mutation queue never speak a wire protocol
//! themselves. A concrete client (IMAP or otherwise) implements
//! [`RemoteMailbox`] and is handed in by the caller; tests use in-memory
//! fakes. Methods return futures that are `Send` so handlers can run on
//! spawned tasks.

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors reported by the remote-protocol client.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The requested message no longer exists on the remote side.
    ///
    /// This is a distinct condition, not a generic failure: read paths
    /// react by purging the local copy and telling the client the item
    /// is gone.
    #[error("Message no longer exists on the server")]
    NotFound,

    /// Connecting or authenticating to the server failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A protocol operation failed.
    #[error("Operation failed: {0}")]
    Operation(String),
}

/// Result type alias for remote operations.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Status of a selected remote mailbox.
#[derive(Debug, Clone, Copy)]
pub struct MailboxStatus {
    /// Generation identifier (UIDVALIDITY). Changes whenever the mailbox
    /// UID numbering space is invalidated; a change means every cached
    /// UID for the mailbox is meaningless.
    pub uid_validity: u32,
}

/// A UID together with its unread flag, as observed remotely.
#[derive(Debug, Clone, Copy)]
pub struct UidEntry {
    /// Remote-assigned UID.
    pub uid: u32,
    /// Whether the message is unread.
    pub unread: bool,
}

/// Envelope metadata for one remote message, without body content.
#[derive(Debug, Clone)]
pub struct MessageOverview {
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
    /// Preview snippet of the body.
    pub snippet: String,
    /// Whether the message is unread.
    pub unread: bool,
    /// References header for threading (may be empty).
    pub references: String,
    /// Attachment metadata (content is never fetched here).
    pub attachments: Vec<AttachmentOverview>,
}

/// Attachment metadata observed on a remote message.
#[derive(Debug, Clone)]
pub struct AttachmentOverview {
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

/// Body content fetched for one message.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    /// Full body content.
    pub body: String,
    /// Preview snippet derived from the body.
    pub snippet: String,
}

/// Operations the reconciler and mutation queue need from a connected
/// remote-protocol client.
///
/// Calls are expected to carry their own timeouts; any failure aborts the
/// caller's current pass and is retried on the next cycle.
pub trait RemoteMailbox {
    /// Current status of a mailbox, including its generation identifier.
    fn mailbox_status(
        &mut self,
        mailbox: &str,
    ) -> impl Future<Output = RemoteResult<MailboxStatus>> + Send;

    /// Metadata for the most recent `count` messages by sequence number.
    fn fetch_recent_overviews(
        &mut self,
        mailbox: &str,
        count: u32,
    ) -> impl Future<Output = RemoteResult<Vec<MessageOverview>>> + Send;

    /// UIDs and unread flags for every message received since `since`.
    fn search_uids_since(
        &mut self,
        mailbox: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = RemoteResult<Vec<UidEntry>>> + Send;

    /// Metadata for an explicit set of UIDs.
    fn fetch_overviews(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> impl Future<Output = RemoteResult<Vec<MessageOverview>>> + Send;

    /// The full UID set currently present in the mailbox.
    fn list_uids(&mut self, mailbox: &str)
    -> impl Future<Output = RemoteResult<Vec<u32>>> + Send;

    /// Full body content for one message.
    ///
    /// Returns [`RemoteError::NotFound`] if the message vanished.
    fn fetch_body(
        &mut self,
        mailbox: &str,
        uid: u32,
    ) -> impl Future<Output = RemoteResult<FetchedBody>> + Send;

    /// Permanently delete a message.
    fn delete(&mut self, mailbox: &str, uid: u32)
    -> impl Future<Output = RemoteResult<()>> + Send;

    /// Move a message to the trash mailbox.
    fn move_to_trash(
        &mut self,
        mailbox: &str,
        uid: u32,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Mark a message as read.
    fn mark_read(
        &mut self,
        mailbox: &str,
        uid: u32,
    ) -> impl Future<Output = RemoteResult<()>> + Send;
}

/// Factory that opens a remote session for one account.
///
/// The daemon holds one connector for its whole lifetime and connects per
/// reconciliation pass; the IPC layer uses the same connector for on-demand
/// body fetches.
pub trait RemoteConnector: Send + Sync + 'static {
    /// The connected client type.
    type Remote: RemoteMailbox + Send;

    /// Connect and authenticate a session for `account`.
    fn connect(&self, account: &str)
    -> impl Future<Output = RemoteResult<Self::Remote>> + Send;
}
