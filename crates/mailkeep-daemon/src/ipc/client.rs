//! Typed IPC client.
//!
//! Interactive front ends use this instead of speaking JSON themselves.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use mailkeep_core::{CachedMessage, MutationKind};

use super::protocol::{Request, Response};
use crate::{Error, Result};

/// Sync status of one account as reported by the daemon.
#[derive(Debug, Clone, Copy)]
pub struct AccountStatus {
    /// When the account last completed a reconciliation pass.
    pub last_sync: Option<DateTime<Utc>>,
    /// Mutations still waiting for remote confirmation.
    pub pending_mutations: i64,
}

/// Outcome of a body read.
#[derive(Debug, Clone)]
pub enum BodyOutcome {
    /// The message, body included.
    Message(Box<CachedMessage>),
    /// The message no longer exists; remove it from the view.
    Gone,
}

/// A connected IPC client.
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IpcClient {
    /// Connect to the daemon socket and perform the version handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is unreachable or the handshake
    /// fails.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
        };

        let response = client
            .exchange(&Request::Hello {
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
            .await?;
        match response {
            Response::Hello { version } => {
                debug!(daemon_version = version, "connected to daemon");
                Ok(client)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Liveness check.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an unexpected answer.
    pub async fn ping(&mut self) -> Result<()> {
        match self.exchange(&Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Read a page of cached messages. Never triggers a remote call.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a daemon-side failure.
    pub async fn get_messages(
        &mut self,
        account: &str,
        mailbox: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CachedMessage>> {
        let request = Request::GetMessages {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            limit,
            offset,
        };
        match self.exchange(&request).await? {
            Response::Messages { messages } => Ok(messages),
            other => Err(unexpected(&other)),
        }
    }

    /// Read one message with its body, possibly triggering an on-demand
    /// remote fetch on the daemon side.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a daemon-side failure;
    /// a vanished message is the [`BodyOutcome::Gone`] value, not an
    /// error.
    pub async fn get_message_body(
        &mut self,
        account: &str,
        mailbox: &str,
        uid: u32,
    ) -> Result<BodyOutcome> {
        let request = Request::GetMessageBody {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid,
        };
        match self.exchange(&request).await? {
            Response::MessageBody { message } => Ok(BodyOutcome::Message(Box::new(message))),
            Response::Gone => Ok(BodyOutcome::Gone),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask for an out-of-cycle sync. Returns false if a pass for that
    /// account is already in flight.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a daemon-side failure.
    pub async fn request_sync(&mut self, account: &str) -> Result<bool> {
        let request = Request::RequestSync {
            account: account.to_string(),
        };
        match self.exchange(&request).await? {
            Response::SyncAccepted => Ok(true),
            Response::SyncBusy => Ok(false),
            other => Err(unexpected(&other)),
        }
    }

    /// Durably enqueue a mutation. Returns its queue id; remote success
    /// is never reported synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a daemon-side failure.
    pub async fn submit_mutation(
        &mut self,
        account: &str,
        mailbox: &str,
        uid: u32,
        kind: MutationKind,
    ) -> Result<i64> {
        let request = Request::SubmitMutation {
            account: account.to_string(),
            mailbox: mailbox.to_string(),
            uid,
            kind,
        };
        match self.exchange(&request).await? {
            Response::MutationAccepted { id } => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// Read sync status for an account.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a daemon-side failure.
    pub async fn get_status(&mut self, account: &str) -> Result<AccountStatus> {
        let request = Request::GetStatus {
            account: account.to_string(),
        };
        match self.exchange(&request).await? {
            Response::Status {
                last_sync,
                pending_mutations,
            } => Ok(AccountStatus {
                last_sync,
                pending_mutations,
            }),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the daemon to shut down.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an unexpected answer.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.exchange(&Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        self.writer.write_all(&payload).await?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(Error::ConnectionClosed);
        }
        match serde_json::from_str::<Response>(&line)? {
            Response::Error { message } => Err(Error::Ipc(message)),
            response => Ok(response),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::UnexpectedResponse(format!("{response:?}"))
}
