//! Integration tests for the daemon's IPC surface.
//!
//! These tests run a real server on a Unix socket in a temp directory and
//! drive it through the typed client, with an in-memory fake standing in
//! for the remote mail server.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use mailkeep_core::{
    CachedMessage, FetchedBody, LockManager, LockRecord, MailboxCheckpoint, MailboxStatus,
    MessageOverview, MutationKind, ProcessProbe, RemoteConnector, RemoteError, RemoteMailbox,
    RemoteResult, Store, UidEntry,
};
use mailkeep_daemon::{AccountConfig, BodyOutcome, Daemon, DaemonConfig, IpcClient, IpcServer};

const ACCOUNT: &str = "a@example.com";
const MAILBOX: &str = "INBOX";
const OTHER_PID: u32 = 424_242;

/// Shared state of the fake mail server.
#[derive(Default)]
struct ServerState {
    /// UIDs that exist remotely; bodies are derived from the UID.
    uids: HashSet<u32>,
    /// Envelope metadata served for reconciliation passes.
    overviews: Vec<MessageOverview>,
}

impl ServerState {
    fn add_message(&mut self, uid: u32) {
        self.uids.insert(uid);
        let when = Utc::now() - chrono::Duration::minutes(i64::from(1000 - uid));
        self.overviews.push(MessageOverview {
            uid,
            message_id: format!("<{uid}@example.com>"),
            internal_date: when,
            from: "sender@example.com".to_string(),
            reply_to: String::new(),
            to: "me@example.com".to_string(),
            subject: format!("Message {uid}"),
            date: when,
            snippet: String::new(),
            unread: true,
            references: String::new(),
            attachments: Vec::new(),
        });
    }
}

#[derive(Clone)]
struct FakeRemote {
    state: Arc<Mutex<ServerState>>,
}

impl RemoteMailbox for FakeRemote {
    fn mailbox_status(
        &mut self,
        _mailbox: &str,
    ) -> impl Future<Output = RemoteResult<MailboxStatus>> + Send {
        async { Ok(MailboxStatus { uid_validity: 1 }) }
    }

    fn fetch_recent_overviews(
        &mut self,
        _mailbox: &str,
        count: u32,
    ) -> impl Future<Output = RemoteResult<Vec<MessageOverview>>> + Send {
        let mut overviews = self.state.lock().unwrap().overviews.clone();
        overviews.sort_by_key(|m| std::cmp::Reverse(m.uid));
        overviews.truncate(count as usize);
        async move { Ok(overviews) }
    }

    fn search_uids_since(
        &mut self,
        _mailbox: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = RemoteResult<Vec<UidEntry>>> + Send {
        let entries: Vec<UidEntry> = self
            .state
            .lock()
            .unwrap()
            .overviews
            .iter()
            .filter(|m| m.internal_date >= since)
            .map(|m| UidEntry {
                uid: m.uid,
                unread: m.unread,
            })
            .collect();
        async move { Ok(entries) }
    }

    fn fetch_overviews(
        &mut self,
        _mailbox: &str,
        uids: &[u32],
    ) -> impl Future<Output = RemoteResult<Vec<MessageOverview>>> + Send {
        let wanted: HashSet<u32> = uids.iter().copied().collect();
        let found: Vec<MessageOverview> = self
            .state
            .lock()
            .unwrap()
            .overviews
            .iter()
            .filter(|m| wanted.contains(&m.uid))
            .cloned()
            .collect();
        async move { Ok(found) }
    }

    fn list_uids(&mut self, _mailbox: &str) -> impl Future<Output = RemoteResult<Vec<u32>>> + Send {
        let uids: Vec<u32> = self.state.lock().unwrap().uids.iter().copied().collect();
        async move { Ok(uids) }
    }

    fn fetch_body(
        &mut self,
        _mailbox: &str,
        uid: u32,
    ) -> impl Future<Output = RemoteResult<FetchedBody>> + Send {
        let exists = self.state.lock().unwrap().uids.contains(&uid);
        async move {
            if exists {
                Ok(FetchedBody {
                    body: format!("body of {uid}"),
                    snippet: format!("snippet of {uid}"),
                })
            } else {
                Err(RemoteError::NotFound)
            }
        }
    }

    fn delete(&mut self, _mailbox: &str, uid: u32) -> impl Future<Output = RemoteResult<()>> + Send {
        self.state.lock().unwrap().uids.remove(&uid);
        async { Ok(()) }
    }

    fn move_to_trash(
        &mut self,
        _mailbox: &str,
        uid: u32,
    ) -> impl Future<Output = RemoteResult<()>> + Send {
        self.state.lock().unwrap().uids.remove(&uid);
        async { Ok(()) }
    }

    fn mark_read(
        &mut self,
        _mailbox: &str,
        _uid: u32,
    ) -> impl Future<Output = RemoteResult<()>> + Send {
        async { Ok(()) }
    }
}

struct FakeConnector {
    state: Arc<Mutex<ServerState>>,
}

impl RemoteConnector for FakeConnector {
    type Remote = FakeRemote;

    fn connect(&self, _account: &str) -> impl Future<Output = RemoteResult<Self::Remote>> + Send {
        let remote = FakeRemote {
            state: Arc::clone(&self.state),
        };
        async move { Ok(remote) }
    }
}

/// Probe that considers exactly one foreign PID alive.
struct FakeProbe;

impl ProcessProbe for FakeProbe {
    fn start_fingerprint(&self, pid: u32) -> Option<String> {
        (pid == OTHER_PID).then(|| "boot-x".to_string())
    }

    fn is_same_program(&self, _pid: u32) -> bool {
        false
    }

    fn exists(&self, pid: u32) -> bool {
        pid == OTHER_PID
    }
}

struct Harness {
    store: Store,
    client: IpcClient,
    sync_rx: mpsc::Receiver<String>,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<Mutex<ServerState>>,
    _dir: tempfile::TempDir,
}

async fn start() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let socket_path: PathBuf = dir.path().join("daemon.sock");

    let store = Store::in_memory().await.unwrap();
    let state = Arc::new(Mutex::new(ServerState::default()));
    let locks = Arc::new(LockManager::with_probe(store.clone(), FakeProbe));
    let (sync_tx, sync_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = Arc::new(IpcServer::new(
        store.clone(),
        Arc::new(FakeConnector {
            state: Arc::clone(&state),
        }),
        Arc::clone(&locks),
        sync_tx,
        shutdown_tx.clone(),
    ));
    let serve_path = socket_path.clone();
    tokio::spawn(server.serve(serve_path, shutdown_rx));

    // Wait for the socket to appear.
    for _ in 0..100 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let client = IpcClient::connect(&socket_path).await.unwrap();

    Harness {
        store,
        client,
        sync_rx,
        shutdown_tx,
        state,
        _dir: dir,
    }
}

fn message(uid: u32) -> CachedMessage {
    CachedMessage {
        account: ACCOUNT.to_string(),
        mailbox: MAILBOX.to_string(),
        uid,
        message_id: format!("<{uid}@example.com>"),
        internal_date: Utc::now() - chrono::Duration::minutes(i64::from(100 - uid)),
        from: "sender@example.com".to_string(),
        reply_to: String::new(),
        to: "me@example.com".to_string(),
        subject: format!("Message {uid}"),
        date: Utc::now(),
        snippet: String::new(),
        body: String::new(),
        unread: true,
        references: String::new(),
        attachments: Vec::new(),
    }
}

#[tokio::test]
async fn test_ping_and_get_messages() {
    let mut harness = start().await;
    harness.client.ping().await.unwrap();

    harness.store.insert_if_absent(&message(1)).await.unwrap();
    harness.store.insert_if_absent(&message(2)).await.unwrap();

    let page = harness
        .client
        .get_messages(ACCOUNT, MAILBOX, 10, 0)
        .await
        .unwrap();
    // Newest first.
    assert_eq!(page.iter().map(|m| m.uid).collect::<Vec<_>>(), vec![2, 1]);

    let empty = harness
        .client
        .get_messages(ACCOUNT, "Archive", 10, 0)
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_get_message_body_fetches_on_demand_and_caches() {
    let mut harness = start().await;
    harness.store.insert_if_absent(&message(3)).await.unwrap();
    harness.state.lock().unwrap().uids.insert(3);

    let outcome = harness
        .client
        .get_message_body(ACCOUNT, MAILBOX, 3)
        .await
        .unwrap();
    let BodyOutcome::Message(fetched) = outcome else {
        panic!("expected a message");
    };
    assert_eq!(fetched.body, "body of 3");

    // The body is now cached: even after the remote copy vanishes, reads
    // are served locally.
    harness.state.lock().unwrap().uids.remove(&3);
    let outcome = harness
        .client
        .get_message_body(ACCOUNT, MAILBOX, 3)
        .await
        .unwrap();
    assert!(matches!(outcome, BodyOutcome::Message(_)));
}

#[tokio::test]
async fn test_get_message_body_vanished_remotely_is_gone() {
    let mut harness = start().await;
    harness.store.insert_if_absent(&message(4)).await.unwrap();
    // UID 4 is cached locally but absent remotely.

    let outcome = harness
        .client
        .get_message_body(ACCOUNT, MAILBOX, 4)
        .await
        .unwrap();
    assert!(matches!(outcome, BodyOutcome::Gone));

    // The stale cached copy was purged.
    assert!(
        harness
            .store
            .get_message(ACCOUNT, MAILBOX, 4)
            .await
            .unwrap()
            .is_none()
    );

    // A UID the store never had is also just gone.
    let outcome = harness
        .client
        .get_message_body(ACCOUNT, MAILBOX, 99)
        .await
        .unwrap();
    assert!(matches!(outcome, BodyOutcome::Gone));
}

#[tokio::test]
async fn test_submit_mutation_is_durable_with_local_effect() {
    let mut harness = start().await;
    harness.store.insert_if_absent(&message(5)).await.unwrap();
    harness.store.insert_if_absent(&message(6)).await.unwrap();

    harness
        .client
        .submit_mutation(ACCOUNT, MAILBOX, 5, MutationKind::MoveToTrash)
        .await
        .unwrap();
    // Queued durably and hidden from the local view immediately.
    assert_eq!(harness.store.pending_count(ACCOUNT).await.unwrap(), 1);
    assert!(
        harness
            .store
            .get_message(ACCOUNT, MAILBOX, 5)
            .await
            .unwrap()
            .is_none()
    );

    harness
        .client
        .submit_mutation(ACCOUNT, MAILBOX, 6, MutationKind::MarkRead)
        .await
        .unwrap();
    let kept = harness
        .store
        .get_message(ACCOUNT, MAILBOX, 6)
        .await
        .unwrap()
        .unwrap();
    assert!(!kept.unread);
    assert_eq!(harness.store.pending_count(ACCOUNT).await.unwrap(), 2);
}

#[tokio::test]
async fn test_request_sync_busy_while_lock_held() {
    let mut harness = start().await;

    // Another live process holds the account's sync lock.
    harness
        .store
        .try_insert_lock(
            ACCOUNT,
            &LockRecord {
                pid: OTHER_PID,
                start_fingerprint: "boot-x".to_string(),
                acquired_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    assert!(!harness.client.request_sync(ACCOUNT).await.unwrap());

    // Lock released: the request is accepted and reaches the scheduler.
    harness.store.delete_lock(ACCOUNT).await.unwrap();
    assert!(harness.client.request_sync(ACCOUNT).await.unwrap());
    assert_eq!(harness.sync_rx.recv().await.unwrap(), ACCOUNT);
}

#[tokio::test]
async fn test_daemon_initial_pass_populates_store() {
    let store = Store::in_memory().await.unwrap();
    let state = Arc::new(Mutex::new(ServerState::default()));
    for uid in 1..=3 {
        state.lock().unwrap().add_message(uid);
    }

    let config = DaemonConfig {
        accounts: vec![AccountConfig {
            name: ACCOUNT.to_string(),
            mailboxes: vec![MAILBOX.to_string()],
        }],
        // Long intervals: only the immediate startup pass fires.
        sync_interval_secs: 3600,
        drain_interval_secs: 3600,
        ..DaemonConfig::default()
    };
    let daemon = Arc::new(Daemon::new(
        store.clone(),
        Arc::new(FakeConnector {
            state: Arc::clone(&state),
        }),
        Arc::new(LockManager::with_probe(store.clone(), FakeProbe)),
        config,
    ));

    let (_sync_tx, sync_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Arc::clone(&daemon);
    let task = tokio::spawn(async move { runner.run(sync_rx, shutdown_rx).await });

    // Wait for the startup pass to land.
    for _ in 0..200 {
        if store.count_messages(ACCOUNT, MAILBOX).await.unwrap() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.count_messages(ACCOUNT, MAILBOX).await.unwrap(), 3);
    // Bodies were prefetched and the checkpoint written.
    let newest = store.get_message(ACCOUNT, MAILBOX, 3).await.unwrap().unwrap();
    assert_eq!(newest.body, "body of 3");
    assert!(
        store
            .last_sync_for_account(ACCOUNT)
            .await
            .unwrap()
            .is_some()
    );
    // The pass released its lock.
    assert!(store.lock_record(ACCOUNT).await.unwrap().is_none());

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_get_status() {
    let mut harness = start().await;

    let status = harness.client.get_status(ACCOUNT).await.unwrap();
    assert!(status.last_sync.is_none());
    assert_eq!(status.pending_mutations, 0);

    let checkpoint = MailboxCheckpoint {
        uid_validity: 1,
        last_sync: Utc::now(),
    };
    harness
        .store
        .save_checkpoint(ACCOUNT, MAILBOX, &checkpoint)
        .await
        .unwrap();
    harness
        .store
        .enqueue_mutation(ACCOUNT, MAILBOX, 1, MutationKind::Delete)
        .await
        .unwrap();

    let status = harness.client.get_status(ACCOUNT).await.unwrap();
    assert!(status.last_sync.is_some());
    assert_eq!(status.pending_mutations, 1);
}

#[tokio::test]
async fn test_shutdown_request_signals_daemon() {
    let mut harness = start().await;
    let mut observer = harness.shutdown_tx.subscribe();

    harness.client.shutdown().await.unwrap();
    observer.changed().await.unwrap();
    assert!(*observer.borrow());
}
