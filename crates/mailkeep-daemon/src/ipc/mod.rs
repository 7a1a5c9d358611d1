//! Local IPC between interactive clients and the daemon.
//!
//! Newline-delimited JSON over a Unix domain socket owned by the daemon.
//! Clients read cached state and submit mutations through this channel;
//! they never link remote-protocol code or write the store directly.

mod client;
mod protocol;
mod server;

pub use client::{AccountStatus, BodyOutcome, IpcClient};
pub use protocol::{Request, Response};
pub use server::IpcServer;
