//! Background sync scheduler.
//!
//! One daemon per machine-user. A single loop wakes on a fixed sync
//! interval, a shorter drain interval, and out-of-cycle sync requests
//! arriving over IPC. A pass that has started always runs to completion:
//! the select decides only *why* the loop woke, and shutdown is checked
//! between passes, never mid-write.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use mailkeep_core::{
    drain_account, LockManager, ProcessProbe, Reconciler, RemoteConnector, RemoteMailbox, Store,
    SystemProbe,
};

use crate::config::{self, AccountConfig, DaemonConfig};
use crate::identity::{self, SystemControl};
use crate::ipc::IpcServer;
use crate::Result;

/// Lifecycle states of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Not running.
    Stopped,
    /// Performing startup work.
    Starting,
    /// Scheduler loop active.
    Running,
    /// Finishing the in-flight pass before exit.
    Stopping,
}

enum Wake {
    ScheduledSync,
    RequestedSync(String),
    Drain,
    Shutdown,
}

/// Run a complete daemon process until a termination signal arrives.
///
/// Performs the startup self-check (terminating an outdated daemon if one
/// is found), records this process's identity, opens the store at the
/// default location, hosts the IPC socket, and drives the scheduler.
/// SIGTERM, SIGINT, and an IPC `Shutdown` request all stop the loop after
/// the in-flight pass; the identity record and socket are removed on the
/// way out.
///
/// # Errors
///
/// Returns an error if another up-to-date daemon is already running or
/// if startup resources (store, socket) cannot be set up.
pub async fn run_daemon<C: RemoteConnector>(connector: C, config: DaemonConfig) -> Result<()> {
    let identity_path = config::identity_path()?;
    identity::take_over(&identity_path, &SystemControl).await?;

    let database_path = config::database_path()?;
    let store = Store::open(&database_path.to_string_lossy()).await?;
    let connector = Arc::new(connector);
    let locks = Arc::new(LockManager::with_probe(store.clone(), SystemProbe));

    let (sync_tx, sync_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx.clone());

    let server = Arc::new(IpcServer::new(
        store.clone(),
        Arc::clone(&connector),
        Arc::clone(&locks),
        sync_tx,
        shutdown_tx,
    ));
    let socket_path = config::socket_path()?;
    let server_task = tokio::spawn(server.serve(socket_path, shutdown_rx.clone()));

    let daemon = Daemon::new(store, connector, locks, config);
    let result = daemon.run(sync_rx, shutdown_rx).await;

    if let Ok(Err(err)) = server_task.await {
        warn!(error = %err, "IPC server exited with error");
    }
    identity::remove(&identity_path)?;
    result
}

fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    warn!(error = %err, "cannot install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        }
        let _ = shutdown.send(true);
    });
}

/// The background synchronizer.
pub struct Daemon<C: RemoteConnector, P: ProcessProbe> {
    store: Store,
    connector: Arc<C>,
    config: DaemonConfig,
    locks: Arc<LockManager<P>>,
    state: watch::Sender<DaemonState>,
}

impl<C: RemoteConnector, P: ProcessProbe> Daemon<C, P> {
    /// Create a daemon over a store, a remote connector, and a shared
    /// lock manager.
    #[must_use]
    pub fn new(
        store: Store,
        connector: Arc<C>,
        locks: Arc<LockManager<P>>,
        config: DaemonConfig,
    ) -> Self {
        let (state, _) = watch::channel(DaemonState::Stopped);
        Self {
            store,
            connector,
            config,
            locks,
            state,
        }
    }

    /// Observe lifecycle state changes.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    /// Run the scheduler loop until shutdown is signalled.
    ///
    /// `sync_requests` carries account names for out-of-cycle passes
    /// (typically from the IPC layer). Flipping `shutdown` to true stops
    /// the loop after the current pass, never during one.
    ///
    /// # Errors
    ///
    /// This method only fails on startup; once running, per-account
    /// failures are logged and retried on the next cycle.
    pub async fn run(
        &self,
        mut sync_requests: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.state.send_replace(DaemonState::Starting);

        let mut sync_timer = interval(Duration::from_secs(self.config.sync_interval_secs));
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut drain_timer = interval(Duration::from_secs(self.config.drain_interval_secs));
        drain_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first drain tick fires immediately and would duplicate the
        // initial sync's drain.
        drain_timer.reset();

        self.state.send_replace(DaemonState::Running);
        info!(
            accounts = self.config.accounts.len(),
            interval_secs = self.config.sync_interval_secs,
            "daemon running"
        );

        loop {
            let wake = tokio::select! {
                _ = sync_timer.tick() => Wake::ScheduledSync,
                request = sync_requests.recv() => match request {
                    Some(account) => Wake::RequestedSync(account),
                    None => Wake::Shutdown,
                },
                _ = drain_timer.tick() => Wake::Drain,
                _ = shutdown.changed() => Wake::Shutdown,
            };

            // Pass bodies run outside the select: once started they are
            // not cancelled.
            match wake {
                Wake::ScheduledSync => {
                    for account in &self.config.accounts {
                        self.sync_account(account).await;
                    }
                }
                Wake::RequestedSync(name) => match self.config.account(&name) {
                    Ok(account) => {
                        let account = account.clone();
                        self.sync_account(&account).await;
                    }
                    Err(err) => warn!(account = name, error = %err, "sync request rejected"),
                },
                Wake::Drain => self.drain_accounts().await,
                Wake::Shutdown => break,
            }

            if *shutdown.borrow() {
                break;
            }
        }

        self.state.send_replace(DaemonState::Stopping);
        info!("daemon stopping");
        self.state.send_replace(DaemonState::Stopped);
        Ok(())
    }

    /// Run one reconciliation pass for an account, under its sync lock.
    ///
    /// Failure to acquire the lock means another process is already
    /// syncing this account: skip this cycle, do not retry in a loop.
    async fn sync_account(&self, account: &AccountConfig) {
        match self.locks.acquire(&account.name).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(account = account.name, "sync already in flight, skipping");
                return;
            }
            Err(err) => {
                warn!(account = account.name, error = %err, "lock acquisition failed");
                return;
            }
        }

        if let Err(err) = self.run_pass(account).await {
            warn!(account = account.name, error = %err, "sync pass failed");
        }

        if let Err(err) = self.locks.release(&account.name).await {
            warn!(account = account.name, error = %err, "lock release failed");
        }
    }

    async fn run_pass(&self, account: &AccountConfig) -> Result<()> {
        let mut remote = self
            .connector
            .connect(&account.name)
            .await
            .map_err(mailkeep_core::Error::from)?;

        let reconciler = Reconciler::with_config(self.store.clone(), self.config.sync_config());
        for mailbox in &account.mailboxes {
            reconciler
                .sync_mailbox(&mut remote, &account.name, mailbox)
                .await?;
        }

        self.drain_one(&account.name, &mut remote).await?;
        Ok(())
    }

    /// Opportunistic drain between reconciliation cycles, so queued
    /// mutations do not wait up to a full sync interval.
    async fn drain_accounts(&self) {
        for account in &self.config.accounts {
            let pending = match self.store.pending_count(&account.name).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(account = account.name, error = %err, "pending count failed");
                    continue;
                }
            };
            if pending == 0 {
                continue;
            }

            match self.locks.acquire(&account.name).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(account = account.name, error = %err, "lock acquisition failed");
                    continue;
                }
            }

            let result = match self.connector.connect(&account.name).await {
                Ok(mut remote) => self.drain_one(&account.name, &mut remote).await,
                Err(err) => Err(mailkeep_core::Error::from(err).into()),
            };
            if let Err(err) = result {
                warn!(account = account.name, error = %err, "drain failed");
            }

            if let Err(err) = self.locks.release(&account.name).await {
                warn!(account = account.name, error = %err, "lock release failed");
            }
        }
    }

    async fn drain_one<R: RemoteMailbox>(&self, account: &str, remote: &mut R) -> Result<()> {
        let outcome = drain_account(&self.store, remote, account).await?;
        if outcome.processed > 0 || outcome.failed > 0 {
            debug!(
                account,
                processed = outcome.processed,
                failed = outcome.failed,
                "mutation queue drained"
            );
        }
        Ok(())
    }
}
