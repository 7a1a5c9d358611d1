//! Process liveness and identity probing.

use std::path::Path;
use std::process::Command;

/// Inspects live processes on the local machine.
///
/// The lock manager needs three observations about a PID found in a lock
/// record: whether it exists, its start-time fingerprint, and whether it
/// runs the same program as us. Tests substitute a fake.
pub trait ProcessProbe: Send + Sync {
    /// Start-time fingerprint of a process, or `None` if unobtainable.
    ///
    /// Two processes that reuse the same PID across a reboot or PID wrap
    /// have different fingerprints.
    fn start_fingerprint(&self, pid: u32) -> Option<String>;

    /// Whether the process runs the same program as the current one.
    fn is_same_program(&self, pid: u32) -> bool;

    /// Whether a process with this PID exists at all.
    fn exists(&self, pid: u32) -> bool;
}

/// [`ProcessProbe`] backed by `/proc` and the `ps` utility.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    fn ps_column(pid: u32, column: &str) -> Option<String> {
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", column])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() { None } else { Some(value) }
    }
}

impl SystemProbe {
    /// Field 22 of `/proc/<pid>/stat`: process start time in clock ticks
    /// since boot. Stable for the lifetime of the process and different
    /// for any PID reuse.
    fn proc_start_ticks(pid: u32) -> Option<String> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // The comm field (2) may contain spaces; fields are only
        // well-delimited after its closing paren.
        let after_comm = stat.get(stat.rfind(')')? + 2..)?;
        after_comm
            .split_whitespace()
            .nth(19)
            .map(ToString::to_string)
    }
}

impl ProcessProbe for SystemProbe {
    fn start_fingerprint(&self, pid: u32) -> Option<String> {
        if let Some(ticks) = Self::proc_start_ticks(pid) {
            return Some(ticks);
        }
        // Non-procfs platforms: lstart is a full start timestamp.
        Self::ps_column(pid, "lstart=")
    }

    fn is_same_program(&self, pid: u32) -> bool {
        let Some(their_comm) = Self::ps_column(pid, "comm=") else {
            return false;
        };
        let Some(our_comm) = Self::ps_column(std::process::id(), "comm=") else {
            return false;
        };
        their_comm == our_comm
    }

    fn exists(&self, pid: u32) -> bool {
        if Path::new(&format!("/proc/{pid}")).exists() {
            return true;
        }
        // Non-procfs platforms: fall back to asking ps.
        Self::ps_column(pid, "pid=").is_some()
    }
}
