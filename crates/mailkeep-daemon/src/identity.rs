//! Daemon identity and version-aware takeover.
//!
//! A running daemon records `PID:VERSION` in a well-known file. On
//! launch, a new daemon reads it: a live holder of the same version wins
//! and the newcomer backs off; a live holder of a *different* version is
//! told to terminate and, after a bounded grace period, forcibly killed,
//! so a stale binary never survives an upgrade and keeps running old
//! logic indefinitely.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{Error, Result};

/// How long a superseded daemon gets to exit gracefully.
pub const TAKEOVER_GRACE: Duration = Duration::from_secs(5);

const POLL_STEP: Duration = Duration::from_millis(100);

/// Identity of a (possibly running) daemon process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonIdentity {
    /// Holder's process identifier.
    pub pid: u32,
    /// Version tag the holder was built from.
    pub version: String,
}

impl DaemonIdentity {
    /// Identity of the current process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl fmt::Display for DaemonIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.version)
    }
}

impl FromStr for DaemonIdentity {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let (pid, version) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::MalformedIdentity(value.to_string()))?;
        let pid = pid
            .parse::<u32>()
            .map_err(|_| Error::MalformedIdentity(value.to_string()))?;
        Ok(Self {
            pid,
            version: version.to_string(),
        })
    }
}

/// Read the recorded identity, if any.
///
/// An unreadable or malformed record is reported, not silently treated
/// as absent; the caller decides whether to clobber it.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read(path: &Path) -> Result<Option<DaemonIdentity>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(Some(raw.parse()?))
}

/// Record an identity.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write(path: &Path, identity: &DaemonIdentity) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, identity.to_string())?;
    Ok(())
}

/// Remove the identity record. Missing files are fine.
///
/// # Errors
///
/// Returns an error if removal fails for a reason other than absence.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Sends signals to, and observes liveness of, other processes.
///
/// Tests substitute a fake so takeover logic can be exercised without
/// real processes.
pub trait ProcessControl: Send + Sync {
    /// Whether a process with this PID exists.
    fn exists(&self, pid: u32) -> bool;

    /// Ask the process to terminate gracefully.
    fn terminate(&self, pid: u32);

    /// Forcibly kill the process.
    fn kill(&self, pid: u32);
}

/// [`ProcessControl`] backed by Unix signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemControl;

#[allow(unsafe_code)]
impl ProcessControl for SystemControl {
    fn exists(&self, pid: u32) -> bool {
        // Signal 0 performs the permission and existence checks only.
        // SAFETY: kill(2) with signal 0 delivers nothing.
        unsafe { libc::kill(pid_t(pid), 0) == 0 }
    }

    fn terminate(&self, pid: u32) {
        // SAFETY: sending SIGTERM to an arbitrary PID we previously
        // recorded; worst case the signal goes nowhere.
        unsafe {
            libc::kill(pid_t(pid), libc::SIGTERM);
        }
    }

    fn kill(&self, pid: u32) {
        // SAFETY: as above, with SIGKILL.
        unsafe {
            libc::kill(pid_t(pid), libc::SIGKILL);
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn pid_t(pid: u32) -> libc::pid_t {
    pid as libc::pid_t
}

/// What the recorded identity means for a daemon trying to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityCheck {
    /// No record, or the record is our own: free to proceed.
    Fresh,
    /// A live daemon of our version already holds the identity.
    AlreadyRunning(u32),
    /// A record exists but its process is dead or the record is corrupt.
    StaleRecord,
    /// A live daemon of a different version holds the identity.
    VersionMismatch(DaemonIdentity),
}

/// Classify the recorded identity against the current process.
///
/// # Errors
///
/// Returns an error if the record cannot be read. A *corrupt* record is
/// not an error: it cannot name a holder to respect and classifies as
/// [`IdentityCheck::StaleRecord`].
pub fn check<P: ProcessControl>(path: &Path, control: &P) -> Result<IdentityCheck> {
    let own = DaemonIdentity::current();
    let existing = match read(path) {
        Ok(Some(existing)) => existing,
        Ok(None) => return Ok(IdentityCheck::Fresh),
        Err(Error::MalformedIdentity(raw)) => {
            warn!(record = raw, "discarding corrupt daemon identity record");
            return Ok(IdentityCheck::StaleRecord);
        }
        Err(err) => return Err(err),
    };

    if existing.pid == own.pid {
        return Ok(IdentityCheck::Fresh);
    }
    if !control.exists(existing.pid) {
        return Ok(IdentityCheck::StaleRecord);
    }
    if existing.version == own.version {
        return Ok(IdentityCheck::AlreadyRunning(existing.pid));
    }
    Ok(IdentityCheck::VersionMismatch(existing))
}

/// Establish this process as the sole daemon for this user.
///
/// A dead or absent holder is replaced outright; a live holder of a
/// different version is terminated and, if it ignores the signal past
/// [`TAKEOVER_GRACE`], killed. On success the current process's identity
/// is on disk.
///
/// # Errors
///
/// Returns [`Error::AlreadyRunning`] if an up-to-date daemon already
/// holds the identity, or an I/O error if the record cannot be updated.
pub async fn take_over<P: ProcessControl>(path: &Path, control: &P) -> Result<()> {
    match check(path, control)? {
        IdentityCheck::Fresh => {}
        IdentityCheck::StaleRecord => {
            debug!("replacing stale daemon identity record");
        }
        IdentityCheck::AlreadyRunning(pid) => return Err(Error::AlreadyRunning(pid)),
        IdentityCheck::VersionMismatch(existing) => {
            info!(
                pid = existing.pid,
                old_version = existing.version,
                "terminating outdated daemon"
            );
            control.terminate(existing.pid);
            wait_for_exit(control, existing.pid).await;
            if control.exists(existing.pid) {
                warn!(pid = existing.pid, "outdated daemon ignored SIGTERM, killing");
                control.kill(existing.pid);
            }
        }
    }

    write(path, &DaemonIdentity::current())
}

async fn wait_for_exit<P: ProcessControl>(control: &P, pid: u32) {
    let deadline = tokio::time::Instant::now() + TAKEOVER_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !control.exists(pid) {
            return;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}
