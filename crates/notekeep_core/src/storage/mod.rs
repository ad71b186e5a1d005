//! JSON file storage primitives.
//!
//! # Responsibility
//! - Write the collection file atomically (temp sibling + rename).
//! - Keep timestamped backup snapshots and redact deleted records from them.
//! - Serialize access to the collection file within and across processes.
//! - Validate and repair the collection file at startup.
//!
//! # Invariants
//! - The collection file, when present, always holds a JSON array.
//! - All collection file mutation happens through `atomic::atomic_write`.
//! - Backup housekeeping never fails a caller's read or write.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;
use std::path::{Path, PathBuf};

pub mod atomic;
pub mod backup;
pub mod integrity;
pub mod lock;

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence error surfaced to store callers.
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem operation failed for reasons other than content validity.
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    /// Collection file content is not a JSON array.
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// Collection could not be encoded.
    Serialize(serde_json::Error),
    /// Exclusive lock was not obtained within the retry budget.
    LockAcquisition { path: PathBuf, attempts: u32 },
    /// Restore was requested but no usable snapshot exists.
    NoBackupAvailable { backup_dir: PathBuf },
    /// Collection handed to a save repeats a record id.
    DuplicateId(String),
    /// Store configuration was rejected.
    InvalidConfig(String),
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Stable short code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io_failure",
            Self::Corrupt { .. } => "corruption_detected",
            Self::Serialize(_) => "serialize_failed",
            Self::LockAcquisition { .. } => "lock_acquisition_failed",
            Self::NoBackupAvailable { .. } => "no_backup_available",
            Self::DuplicateId(_) => "duplicate_id",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { op, path, source } => {
                write!(f, "failed to {op} `{}`: {source}", path.display())
            }
            Self::Corrupt { path, source } => write!(
                f,
                "collection file `{}` is not a valid JSON array: {source}",
                path.display()
            ),
            Self::Serialize(err) => write!(f, "failed to encode collection: {err}"),
            Self::LockAcquisition { path, attempts } => write!(
                f,
                "could not lock `{}` after {attempts} attempts",
                path.display()
            ),
            Self::NoBackupAvailable { backup_dir } => write!(
                f,
                "no usable backup snapshot in `{}`",
                backup_dir.display()
            ),
            Self::DuplicateId(id) => write!(f, "collection repeats record id `{id}`"),
            Self::InvalidConfig(message) => write!(f, "invalid store config: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Corrupt { source, .. } => Some(source),
            Self::Serialize(err) => Some(err),
            Self::LockAcquisition { .. }
            | Self::NoBackupAvailable { .. }
            | Self::DuplicateId(_)
            | Self::InvalidConfig(_) => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialize(value)
    }
}
