//! Per-account cross-process sync locks.
//!
//! At most one process may run a reconciliation pass for an account at a
//! time. The lock is a row in the shared database naming the holder's PID
//! plus a process start-time fingerprint, so a crashed holder's lock can
//! be reclaimed safely even if the operating system has reused its PID.

mod probe;

pub use probe::{ProcessProbe, SystemProbe};

use chrono::Utc;
use tracing::{debug, warn};

use crate::store::{LockRecord, Store};
use crate::Result;

/// Manages per-account sync locks in the shared database.
pub struct LockManager<P = SystemProbe> {
    store: Store,
    probe: P,
}

impl LockManager<SystemProbe> {
    /// Create a lock manager backed by the real process table.
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self {
            store,
            probe: SystemProbe,
        }
    }
}

impl<P: ProcessProbe> LockManager<P> {
    /// Create a lock manager with a custom process probe.
    pub const fn with_probe(store: Store, probe: P) -> Self {
        Self { store, probe }
    }

    /// Try to acquire the sync lock for an account.
    ///
    /// Returns true if the lock is now held by this process. A lock held
    /// by a live holder is respected; a record left behind by a dead or
    /// replaced process is reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn acquire(&self, account: &str) -> Result<bool> {
        if let Some(existing) = self.store.lock_record(account).await? {
            if self.holder_is_live(&existing) {
                debug!(
                    account,
                    holder_pid = existing.pid,
                    "sync lock held by live process"
                );
                return Ok(false);
            }

            warn!(
                account,
                holder_pid = existing.pid,
                "reclaiming stale sync lock"
            );
            self.store
                .delete_lock_if_holder(account, existing.pid, &existing.start_fingerprint)
                .await?;
        }

        let record = self.own_record();
        let acquired = self.store.try_insert_lock(account, &record).await?;
        if acquired {
            debug!(account, pid = record.pid, "sync lock acquired");
        }
        Ok(acquired)
    }

    /// Release the lock if this process holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn release(&self, account: &str) -> Result<()> {
        let record = self.own_record();
        self.store
            .delete_lock_if_holder(account, record.pid, &record.start_fingerprint)
            .await?;
        debug!(account, "sync lock released");
        Ok(())
    }

    /// Whether the lock for an account is currently held by a live process.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn is_held(&self, account: &str) -> Result<bool> {
        match self.store.lock_record(account).await? {
            Some(record) => Ok(self.holder_is_live(&record)),
            None => Ok(false),
        }
    }

    /// Decides whether the recorded holder is still the process that wrote
    /// the record.
    ///
    /// With a fingerprint on record, only an exact fingerprint match
    /// counts: a different fingerprint on the same PID means the PID was
    /// reused. Without one, a same-program check is the best available
    /// evidence; a bare existing PID of some other program is treated as
    /// reuse, not as a holder.
    fn holder_is_live(&self, record: &LockRecord) -> bool {
        if !self.probe.exists(record.pid) {
            return false;
        }

        if record.start_fingerprint.is_empty() {
            return self.probe.is_same_program(record.pid);
        }

        self.probe.start_fingerprint(record.pid).as_deref()
            == Some(record.start_fingerprint.as_str())
    }

    fn own_record(&self) -> LockRecord {
        let pid = std::process::id();
        LockRecord {
            pid,
            start_fingerprint: self.probe.start_fingerprint(pid).unwrap_or_default(),
            acquired_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;

    #[derive(Default)]
    struct FakeProbe {
        alive: HashSet<u32>,
        fingerprints: HashMap<u32, String>,
        same_program: HashSet<u32>,
    }

    impl ProcessProbe for FakeProbe {
        fn start_fingerprint(&self, pid: u32) -> Option<String> {
            self.fingerprints.get(&pid).cloned()
        }

        fn is_same_program(&self, pid: u32) -> bool {
            self.same_program.contains(&pid)
        }

        fn exists(&self, pid: u32) -> bool {
            self.alive.contains(&pid)
        }
    }

    fn record(pid: u32, fingerprint: &str) -> LockRecord {
        LockRecord {
            pid,
            start_fingerprint: fingerprint.to_string(),
            acquired_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_acquire_when_free() {
        let store = Store::in_memory().await.unwrap();
        let manager = LockManager::with_probe(store.clone(), FakeProbe::default());

        assert!(manager.acquire("a@example.com").await.unwrap());
        assert!(store.lock_record("a@example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_live_holder_is_respected() {
        let store = Store::in_memory().await.unwrap();
        let mut probe = FakeProbe::default();
        probe.alive.insert(999);
        probe.fingerprints.insert(999, "boot-a".to_string());
        let manager = LockManager::with_probe(store.clone(), probe);

        store
            .try_insert_lock("a@example.com", &record(999, "boot-a"))
            .await
            .unwrap();

        assert!(!manager.acquire("a@example.com").await.unwrap());
        assert!(manager.is_held("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_holder_is_reclaimed() {
        let store = Store::in_memory().await.unwrap();
        let manager = LockManager::with_probe(store.clone(), FakeProbe::default());

        store
            .try_insert_lock("a@example.com", &record(999, "boot-a"))
            .await
            .unwrap();

        assert!(manager.acquire("a@example.com").await.unwrap());
        let holder = store.lock_record("a@example.com").await.unwrap().unwrap();
        assert_eq!(holder.pid, std::process::id());
    }

    #[tokio::test]
    async fn test_reused_pid_is_reclaimed() {
        let store = Store::in_memory().await.unwrap();
        let mut probe = FakeProbe::default();
        // PID 999 exists again, but was started at a different time.
        probe.alive.insert(999);
        probe.fingerprints.insert(999, "boot-b".to_string());
        let manager = LockManager::with_probe(store.clone(), probe);

        store
            .try_insert_lock("a@example.com", &record(999, "boot-a"))
            .await
            .unwrap();

        assert!(manager.acquire("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_fingerprint_falls_back_to_program_check() {
        let store = Store::in_memory().await.unwrap();
        let mut probe = FakeProbe::default();
        probe.alive.insert(999);
        probe.same_program.insert(999);
        let manager = LockManager::with_probe(store.clone(), probe);

        store
            .try_insert_lock("a@example.com", &record(999, ""))
            .await
            .unwrap();

        // Same program, no fingerprint on record: treat as live.
        assert!(!manager.acquire("a@example.com").await.unwrap());

        let mut probe = FakeProbe::default();
        probe.alive.insert(999);
        let manager = LockManager::with_probe(store.clone(), probe);

        // Some unrelated program now owns PID 999: reclaim.
        assert!(manager.acquire("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_the_lock() {
        let store = Store::in_memory().await.unwrap();
        let manager = LockManager::with_probe(store.clone(), FakeProbe::default());

        assert!(manager.acquire("a@example.com").await.unwrap());
        manager.release("a@example.com").await.unwrap();
        assert!(store.lock_record("a@example.com").await.unwrap().is_none());
        assert!(manager.acquire("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_does_not_remove_foreign_lock() {
        let store = Store::in_memory().await.unwrap();
        let mut probe = FakeProbe::default();
        probe.alive.insert(999);
        probe.fingerprints.insert(999, "boot-a".to_string());
        let manager = LockManager::with_probe(store.clone(), probe);

        store
            .try_insert_lock("a@example.com", &record(999, "boot-a"))
            .await
            .unwrap();

        manager.release("a@example.com").await.unwrap();
        assert!(store.lock_record("a@example.com").await.unwrap().is_some());
    }
}
