//! Store configuration.
//!
//! # Responsibility
//! - Carry every path and tuning knob the store needs as an explicit value,
//!   so several stores can coexist in one process.
//!
//! # Invariants
//! - File and directory names are single path components.
//! - The snapshot prefix never collides with the quarantine prefix.

use crate::storage::{StoreError, StoreResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATA_FILE_NAME: &str = "notes.json";
pub const DEFAULT_BACKUP_DIR_NAME: &str = "backups";
pub const DEFAULT_BACKUP_PREFIX: &str = "notes";
/// File name prefix reserved for quarantined corrupt collection files.
pub const QUARANTINE_PREFIX: &str = "corrupt";

const DEFAULT_LOCK_ATTEMPTS: u32 = 5;
const DEFAULT_LOCK_INITIAL_DELAY_MS: u64 = 50;
const DEFAULT_LOCK_MULTIPLIER: f64 = 1.5;

/// Bounded retry schedule for lock acquisition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total acquisition attempts, including the first one.
    pub attempts: u32,
    /// Sleep after the first failed attempt.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Growth factor applied to the delay after every failed attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_LOCK_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_LOCK_INITIAL_DELAY_MS),
            multiplier: DEFAULT_LOCK_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Sleeps taken between attempts; one entry fewer than `attempts`.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut current = self.initial_delay;
        for _ in 1..self.attempts.max(1) {
            delays.push(current);
            current = current.mul_f64(self.multiplier.max(1.0));
        }
        delays
    }
}

/// Paths and policies for one record store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the collection file and the backups directory.
    pub data_dir: PathBuf,
    #[serde(default = "default_data_file_name")]
    pub data_file_name: String,
    #[serde(default = "default_backup_dir_name")]
    pub backup_dir_name: String,
    #[serde(default = "default_backup_prefix")]
    pub backup_prefix: String,
    #[serde(default)]
    pub lock_retry: RetryPolicy,
    /// Keep at most this many snapshots; `None` keeps all of them.
    #[serde(default)]
    pub max_snapshots: Option<usize>,
}

impl StoreConfig {
    /// Builds a config rooted at `data_dir` with default names and policies.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            data_file_name: default_data_file_name(),
            backup_dir_name: default_backup_dir_name(),
            backup_prefix: default_backup_prefix(),
            lock_retry: RetryPolicy::default(),
            max_snapshots: None,
        }
    }

    pub fn with_lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    pub fn with_max_snapshots(mut self, max_snapshots: Option<usize>) -> Self {
        self.max_snapshots = max_snapshots;
        self
    }

    /// Path of the collection (primary) file.
    pub fn data_file(&self) -> PathBuf {
        self.data_dir.join(&self.data_file_name)
    }

    /// Directory holding backup snapshots and quarantine files.
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join(&self.backup_dir_name)
    }

    /// Sidecar file carrying the cross-process advisory lock.
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join(format!("{}.lock", self.data_file_name))
    }

    /// Rejects configurations that would escape `data_dir` or confuse
    /// snapshots with quarantine files.
    pub fn validate(&self) -> StoreResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig(
                "data_dir cannot be empty".to_string(),
            ));
        }
        validate_component("data_file_name", &self.data_file_name)?;
        validate_component("backup_dir_name", &self.backup_dir_name)?;
        validate_component("backup_prefix", &self.backup_prefix)?;

        if self.backup_prefix == QUARANTINE_PREFIX {
            return Err(StoreError::InvalidConfig(format!(
                "backup_prefix `{QUARANTINE_PREFIX}` is reserved for quarantine files"
            )));
        }
        if self.lock_retry.attempts == 0 {
            return Err(StoreError::InvalidConfig(
                "lock_retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.max_snapshots == Some(0) {
            return Err(StoreError::InvalidConfig(
                "max_snapshots must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_component(field: &str, value: &str) -> StoreResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidConfig(format!("{field} cannot be empty")));
    }
    let mut components = Path::new(trimmed).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    );
    if !single_normal || trimmed != value {
        return Err(StoreError::InvalidConfig(format!(
            "{field} must be a plain file name, got `{value}`"
        )));
    }
    Ok(())
}

fn default_data_file_name() -> String {
    DEFAULT_DATA_FILE_NAME.to_string()
}

fn default_backup_dir_name() -> String {
    DEFAULT_BACKUP_DIR_NAME.to_string()
}

fn default_backup_prefix() -> String {
    DEFAULT_BACKUP_PREFIX.to_string()
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
