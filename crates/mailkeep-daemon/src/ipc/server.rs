//! IPC server hosted by the daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use mailkeep_core::{
    LockManager, MutationKind, ProcessProbe, RemoteConnector, RemoteError, RemoteMailbox, Store,
};

use super::protocol::{Request, Response};
use crate::Result;

/// Serves the local IPC socket.
///
/// One spawned handler per connection; every handler funnels reads and
/// writes through the shared [`Store`].
pub struct IpcServer<C: RemoteConnector, P: ProcessProbe> {
    store: Store,
    connector: Arc<C>,
    locks: Arc<LockManager<P>>,
    sync_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl<C, P> IpcServer<C, P>
where
    C: RemoteConnector,
    P: ProcessProbe + 'static,
{
    /// Create a server sharing the daemon's store, connector, and locks.
    #[must_use]
    pub const fn new(
        store: Store,
        connector: Arc<C>,
        locks: Arc<LockManager<P>>,
        sync_tx: mpsc::Sender<String>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            store,
            connector,
            locks,
            sync_tx,
            shutdown_tx,
        }
    }

    /// Accept connections until shutdown is signalled.
    ///
    /// The socket file is owner-only; a leftover socket from a previous
    /// run is removed before binding, and the file is removed again on
    /// the way out.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or secured.
    pub async fn serve(
        self: Arc<Self>,
        socket_path: PathBuf,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        set_owner_only(&socket_path)?;
        debug!(path = %socket_path.display(), "IPC socket listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = server.handle_connection(stream).await {
                                debug!(error = %err, "IPC connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "IPC accept failed"),
                },
                _ = shutdown.changed() => break,
            }
        }

        let _ = std::fs::remove_file(&socket_path);
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(err) => Response::Error {
                    message: format!("malformed request: {err}"),
                },
            };

            let mut payload = serde_json::to_vec(&response)?;
            payload.push(b'\n');
            write_half.write_all(&payload).await?;
        }
        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Hello { version } => {
                debug!(client_version = version, "IPC client connected");
                Response::Hello {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                }
            }
            Request::Ping => Response::Pong,
            Request::GetMessages {
                account,
                mailbox,
                limit,
                offset,
            } => match self.store.list_messages(&account, &mailbox, limit, offset).await {
                Ok(messages) => Response::Messages { messages },
                Err(err) => error_response(&err),
            },
            Request::GetMessageBody {
                account,
                mailbox,
                uid,
            } => self.get_message_body(&account, &mailbox, uid).await,
            Request::RequestSync { account } => self.request_sync(account).await,
            Request::SubmitMutation {
                account,
                mailbox,
                uid,
                kind,
            } => self.submit_mutation(&account, &mailbox, uid, kind).await,
            Request::GetStatus { account } => self.get_status(&account).await,
            Request::Shutdown => {
                let _ = self.shutdown_tx.send(true);
                Response::ShuttingDown
            }
        }
    }

    /// The one read path allowed to touch the remote side outside the
    /// scheduler: a cache miss on the body triggers a synchronous fetch.
    async fn get_message_body(&self, account: &str, mailbox: &str, uid: u32) -> Response {
        let message = match self.store.get_message(account, mailbox, uid).await {
            Ok(Some(message)) => message,
            // Not cached at all: it was pruned or removed, drop it from
            // the client's view.
            Ok(None) => return Response::Gone,
            Err(err) => return error_response(&err),
        };
        if message.has_body() {
            return Response::MessageBody { message };
        }

        let mut remote = match self.connector.connect(account).await {
            Ok(remote) => remote,
            Err(err) => return error_response(&err),
        };
        match remote.fetch_body(mailbox, uid).await {
            Ok(body) => {
                if let Err(err) = self
                    .store
                    .update_body(account, mailbox, uid, &body.body, &body.snippet)
                    .await
                {
                    return error_response(&err);
                }
                match self.store.get_message(account, mailbox, uid).await {
                    Ok(Some(message)) => Response::MessageBody { message },
                    Ok(None) => Response::Gone,
                    Err(err) => error_response(&err),
                }
            }
            Err(RemoteError::NotFound) => {
                // Vanished remotely: purge the stale copy and say so
                // instead of returning a misleading generic error.
                if let Err(err) = self.store.delete_message(account, mailbox, uid).await {
                    return error_response(&err);
                }
                Response::Gone
            }
            Err(err) => error_response(&err),
        }
    }

    /// Best-effort out-of-cycle sync trigger. `busy` is a first-class
    /// outcome, not an error.
    async fn request_sync(&self, account: String) -> Response {
        match self.locks.is_held(&account).await {
            Ok(true) => return Response::SyncBusy,
            Ok(false) => {}
            Err(err) => return error_response(&err),
        }
        if self.sync_tx.send(account).await.is_err() {
            return Response::Error {
                message: "scheduler is not running".to_string(),
            };
        }
        Response::SyncAccepted
    }

    /// Durably enqueue and apply the optimistic local effect; remote
    /// confirmation happens later, on drain.
    async fn submit_mutation(
        &self,
        account: &str,
        mailbox: &str,
        uid: u32,
        kind: MutationKind,
    ) -> Response {
        let id = match self.store.enqueue_mutation(account, mailbox, uid, kind).await {
            Ok(id) => id,
            Err(err) => return error_response(&err),
        };

        let local_effect = match kind {
            MutationKind::Delete | MutationKind::MoveToTrash => {
                self.store.delete_message(account, mailbox, uid).await
            }
            MutationKind::MarkRead => self.store.update_unread(account, mailbox, uid, false).await,
        };
        if let Err(err) = local_effect {
            warn!(account, mailbox, uid, error = %err, "local mutation effect failed");
        }

        Response::MutationAccepted { id }
    }

    async fn get_status(&self, account: &str) -> Response {
        let last_sync = match self.store.last_sync_for_account(account).await {
            Ok(last_sync) => last_sync,
            Err(err) => return error_response(&err),
        };
        match self.store.pending_count(account).await {
            Ok(pending_mutations) => Response::Status {
                last_sync,
                pending_mutations,
            },
            Err(err) => error_response(&err),
        }
    }
}

fn error_response(err: &dyn std::fmt::Display) -> Response {
    Response::Error {
        message: err.to_string(),
    }
}

fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
