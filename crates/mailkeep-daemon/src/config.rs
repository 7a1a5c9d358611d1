//! Daemon configuration.
//!
//! Configuration is a JSON file under the platform config directory
//! (`~/.config/mailkeep/config.json` on Linux). Every field has a default
//! so a missing or partial file still yields a working daemon.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mailkeep_core::SyncConfig;

use crate::{Error, Result};

const APP_DIR: &str = "mailkeep";

/// One account the daemon keeps synchronized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account identifier (typically the address).
    pub name: String,
    /// Mailboxes to reconcile each cycle.
    #[serde(default = "default_mailboxes")]
    pub mailboxes: Vec<String>,
}

fn default_mailboxes() -> Vec<String> {
    vec!["INBOX".to_string()]
}

/// Daemon-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Accounts to synchronize.
    pub accounts: Vec<AccountConfig>,
    /// Seconds between full reconciliation cycles.
    pub sync_interval_secs: u64,
    /// Seconds between opportunistic mutation-queue drains.
    pub drain_interval_secs: u64,
    /// Trailing recency window and retention horizon, in days.
    pub window_days: i64,
    /// Minimum number of most-recent messages cached per mailbox.
    pub sequence_floor: u32,
    /// Bodies prefetched per reconciliation pass.
    pub prefetch_count: i64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            sync_interval_secs: 30 * 60,
            drain_interval_secs: 60,
            window_days: 14,
            sequence_floor: 100,
            prefetch_count: 10,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default location, falling back to
    /// defaults when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load configuration from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Find the configuration for an account by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Core`] wrapping an account-not-found condition if
    /// the account is not configured.
    pub fn account(&self, name: &str) -> Result<&AccountConfig> {
        self.accounts
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| mailkeep_core::Error::AccountNotFound(name.to_string()).into())
    }

    /// Reconciliation tunables derived from this configuration.
    #[must_use]
    pub const fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            window_days: self.window_days,
            sequence_floor: self.sequence_floor,
            prefetch_count: self.prefetch_count,
        }
    }
}

/// Path of the configuration file.
///
/// # Errors
///
/// Returns an error if the platform config directory cannot be determined.
pub fn config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("cannot determine config directory".to_string()))?;
    Ok(dir.join(APP_DIR).join("config.json"))
}

/// Path of the replica database.
///
/// # Errors
///
/// Returns an error if the platform data directory cannot be determined.
pub fn database_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("mailkeep.db"))
}

/// Path of the daemon identity file.
///
/// # Errors
///
/// Returns an error if the platform data directory cannot be determined.
pub fn identity_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("daemon.pid"))
}

/// Path of the IPC socket.
///
/// # Errors
///
/// Returns an error if the platform data directory cannot be determined.
pub fn socket_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("daemon.sock"))
}

fn data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .ok_or_else(|| Error::Config("cannot determine data directory".to_string()))?;
    let dir = dir.join(APP_DIR);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.sync_interval_secs, 1800);
        assert_eq!(config.window_days, 14);
        assert_eq!(config.sequence_floor, 100);
        assert_eq!(config.prefetch_count, 10);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = DaemonConfig::load_from(&path).unwrap();
        assert!(config.accounts.is_empty());
        assert_eq!(config.sync_interval_secs, 1800);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"accounts": [{"name": "a@example.com"}], "sync_interval_secs": 60}"#,
        )
        .unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.window_days, 14);
        let account = config.account("a@example.com").unwrap();
        assert_eq!(account.mailboxes, vec!["INBOX".to_string()]);
        assert!(config.account("other@example.com").is_err());
    }
}
