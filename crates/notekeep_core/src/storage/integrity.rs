//! Startup validation and repair of the collection file.
//!
//! # Responsibility
//! - Create the data and backups directories.
//! - Run backup housekeeping before the store serves traffic.
//! - Leave the collection file holding a JSON array, restoring from the
//!   newest usable snapshot or resetting to `[]` when it is corrupt.
//!
//! # Invariants
//! - Repeated runs on a healthy store do not modify the collection file.
//! - Only directory creation failures abort startup; corruption is repaired.
//! - Corrupt bytes are quarantined before a reset discards them.
//! - The collection file is checked and rewritten only under the collection
//!   lock; directory setup and housekeeping run outside it.
//! - A file counts as healthy only if it decodes as the same record
//!   collection `load_all` reads.

use super::atomic::{atomic_write, create_if_absent, sweep_stale_temp_files};
use super::backup::BackupManager;
use super::lock::LockCoordinator;
use super::{StoreError, StoreResult};
use crate::model::record::Collection;
use log::{error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const EMPTY_COLLECTION: &[u8] = b"[]";
/// Temp files younger than this may belong to a write still in flight.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60);

/// Terminal state reached by `ensure_store`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreHealth {
    /// No collection file existed; an empty one was written.
    EmptyInitialized,
    /// The collection file parsed as a JSON array.
    Healthy,
    /// The collection file was corrupt and was restored from `from`.
    Restored { from: PathBuf },
    /// The collection file was corrupt, no usable snapshot existed, and it was
    /// reset to `[]`. `quarantined` holds the corrupt copy when saving it
    /// succeeded.
    ResetEmpty { quarantined: Option<PathBuf> },
}

impl StoreHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyInitialized => "empty_initialized",
            Self::Healthy => "healthy",
            Self::Restored { .. } => "restored",
            Self::ResetEmpty { .. } => "reset_empty",
        }
    }
}

/// Parses collection file bytes into records.
///
/// Requires a top-level JSON array whose items carry a string `id`.
pub fn parse_collection(bytes: &[u8]) -> Result<Collection, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Prepares directories and validates the collection file at `primary`.
///
/// The collection file check runs under `lock`.
///
/// # Errors
/// - `StoreError::Io` when a directory cannot be created; callers must not
///   serve traffic in that case.
/// - `StoreError::LockAcquisition` when the lock stays contended.
/// - `StoreError::Io` when the collection file cannot be read or rewritten.
pub async fn ensure_store(
    data_dir: &Path,
    primary: &Path,
    backups: &BackupManager,
    lock: &LockCoordinator,
) -> StoreResult<StoreHealth> {
    let started_at = Instant::now();
    info!(
        "event=ensure_store module=integrity status=start file={}",
        primary.display()
    );

    for dir in [data_dir, backups.backup_dir()] {
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            error!(
                "event=ensure_store module=integrity status=error error_code=create_dir_failed dir={} error={}",
                dir.display(),
                err
            );
            return Err(StoreError::io("create directory", dir, err));
        }
    }

    backups.prune_empty().await;
    let swept = sweep_stale_temp_files(data_dir, STALE_TEMP_AGE).await
        + sweep_stale_temp_files(backups.backup_dir(), STALE_TEMP_AGE).await;
    if swept > 0 {
        info!(
            "event=temp_sweep module=integrity status=ok removed={}",
            swept
        );
    }

    let health = lock
        .with_exclusive(|| check_primary(primary, backups))
        .await?;
    info!(
        "event=ensure_store module=integrity status=ok health={} duration_ms={}",
        health.as_str(),
        started_at.elapsed().as_millis()
    );
    Ok(health)
}

async fn check_primary(primary: &Path, backups: &BackupManager) -> StoreResult<StoreHealth> {
    let bytes = match tokio::fs::read(primary).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if create_if_absent(primary, EMPTY_COLLECTION).await? {
                return Ok(StoreHealth::EmptyInitialized);
            }
            tokio::fs::read(primary)
                .await
                .map_err(|err| StoreError::io("read", primary, err))?
        }
        Err(err) => return Err(StoreError::io("read", primary, err)),
    };

    let parse_error = match parse_collection(&bytes) {
        Ok(_) => return Ok(StoreHealth::Healthy),
        Err(err) => err,
    };
    warn!(
        "event=corruption_detected module=integrity status=error file={} bytes={} error={}",
        primary.display(),
        bytes.len(),
        parse_error
    );

    match backups.restore_latest_into(primary).await {
        Ok(from) => {
            info!(
                "event=store_recovered module=integrity status=ok source={}",
                from.display()
            );
            return Ok(StoreHealth::Restored { from });
        }
        Err(StoreError::NoBackupAvailable { .. }) => {}
        Err(err) => return Err(err),
    }

    let quarantined = match backups.quarantine(&bytes).await {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(
                "event=quarantine module=integrity status=error error_code={} error={}",
                err.code(),
                err
            );
            None
        }
    };
    atomic_write(primary, EMPTY_COLLECTION).await?;
    warn!(
        "event=store_reset module=integrity status=ok file={} quarantined={}",
        primary.display(),
        quarantined
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(StoreHealth::ResetEmpty { quarantined })
}
