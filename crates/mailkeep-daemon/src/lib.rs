//! # mailkeep-daemon
//!
//! The background half of `mailkeep`: a per-user daemon that keeps
//! configured accounts reconciled on a timer, drains the durable mutation
//! queue, and exposes the local replica to interactive clients over a
//! Unix-socket IPC protocol.
//!
//! A concrete remote-protocol client is supplied by the embedding binary
//! through [`mailkeep_core::RemoteConnector`]; this crate contains no
//! wire-protocol code of its own.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub mod config;
pub mod daemon;
pub mod identity;
pub mod ipc;

pub use config::{AccountConfig, DaemonConfig};
pub use daemon::{run_daemon, Daemon, DaemonState};
pub use error::{Error, Result};
pub use identity::{DaemonIdentity, IdentityCheck, ProcessControl, SystemControl};
pub use ipc::{AccountStatus, BodyOutcome, IpcClient, IpcServer, Request, Response};

/// Initialize tracing for a daemon process.
///
/// Honors `RUST_LOG`; defaults to debug-level logs for the mailkeep
/// crates and warnings elsewhere.
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailkeep_core=debug,mailkeep_daemon=debug,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
