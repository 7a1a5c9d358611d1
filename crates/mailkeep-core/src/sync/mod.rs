//! Mailbox reconciliation.
//!
//! Brings the local replica of one mailbox in line with the remote side
//! in a single bounded-cost pass: a union of "most recent N by sequence"
//! and "everything received in the last T days" is cached, vanished UIDs
//! are dropped, old messages are pruned, and a handful of recent bodies
//! are prefetched.

mod reconciler;

pub use reconciler::{PassSummary, Reconciler, SyncConfig};
