//! JSON file record store.
//!
//! # Responsibility
//! - Expose whole-collection load/save over one JSON array file.
//! - Compose atomic writes, backup snapshots, locking and startup repair.
//!
//! # Invariants
//! - Every load and save runs under the same exclusive lock, so callers see a
//!   linear sequence of whole collections.
//! - A save snapshots the previous file and writes the new one within a
//!   single lock hold.
//! - A saved collection never repeats an id.
//! - Backup redaction does not take the collection lock; it relies on
//!   per-file atomic rewrites and is best-effort.

use crate::config::StoreConfig;
use crate::model::record::{find_duplicate_id, Collection, Record};
use crate::storage::atomic::atomic_write;
use crate::storage::backup::{BackupManager, HousekeepingReport, SnapshotInfo};
use crate::storage::integrity::{self, StoreHealth};
use crate::storage::lock::{FileLocker, LockCoordinator, Locker};
use crate::storage::{StoreError, StoreResult};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Record store bound to one collection file.
#[derive(Clone)]
pub struct RecordStore {
    config: StoreConfig,
    primary: PathBuf,
    backups: BackupManager,
    lock: LockCoordinator,
}

impl RecordStore {
    /// Opens a store that coordinates through OS advisory file locks.
    ///
    /// No I/O happens here; call `ensure_store` before serving requests.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        Self::with_locker(config, Arc::new(FileLocker))
    }

    /// Opens a store that coordinates through `locker`.
    pub fn with_locker(config: StoreConfig, locker: Arc<dyn Locker>) -> StoreResult<Self> {
        config.validate()?;
        let primary = config.data_file();
        let backups = BackupManager::new(&primary, config.backup_dir(), &config.backup_prefix);
        let lock = LockCoordinator::new(
            &primary,
            config.lock_file(),
            locker,
            config.lock_retry.clone(),
        );
        Ok(Self {
            config,
            primary,
            backups,
            lock,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Prepares directories and repairs the collection file.
    ///
    /// Idempotent. Must complete before `load_all`/`save_all` are served.
    pub async fn ensure_store(&self) -> StoreResult<StoreHealth> {
        integrity::ensure_store(
            &self.config.data_dir,
            &self.primary,
            &self.backups,
            &self.lock,
        )
        .await
    }

    /// Reads the whole collection.
    ///
    /// A read failure yields an empty collection.
    ///
    /// # Errors
    /// - `StoreError::LockAcquisition` when the lock stays contended.
    /// - `StoreError::Corrupt` when the file does not hold a record array.
    pub async fn load_all(&self) -> StoreResult<Collection> {
        self.lock.with_lock(|| self.read_or_empty()).await
    }

    /// Replaces the whole collection.
    ///
    /// # Errors
    /// - `StoreError::DuplicateId` before any I/O when ids repeat.
    /// - `StoreError::LockAcquisition` when the lock stays contended.
    /// - `StoreError::Io` when the atomic write fails.
    pub async fn save_all(&self, records: &[Record]) -> StoreResult<()> {
        let encoded = encode_collection(records)?;
        self.lock
            .with_lock(|| self.write_collection(&encoded, records.len()))
            .await
    }

    /// Loads, mutates and saves the collection within one lock hold.
    ///
    /// Nothing is written when `mutate` fails; its error is returned as is.
    /// Unlike `load_all`, a read failure is an error here: the collection is
    /// rewritten from what was read.
    pub async fn update<T, E, F>(&self, mutate: F) -> Result<T, E>
    where
        F: FnOnce(&mut Collection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let outcome = self
            .lock
            .with_lock(|| async {
                let mut records = self.read_collection().await?;
                let value = match mutate(&mut records) {
                    Ok(value) => value,
                    Err(err) => return Ok(Err(err)),
                };
                let encoded = encode_collection(&records)?;
                self.write_collection(&encoded, records.len()).await?;
                Ok(Ok(value))
            })
            .await;

        outcome.map_err(E::from)?
    }

    /// Removes every record with `id` from all backup snapshots.
    ///
    /// Best-effort: per-file failures are counted in the report and logged.
    pub async fn purge_record_from_backups(&self, id: &str) -> HousekeepingReport {
        self.backups.purge_record(id).await
    }

    /// Restores the collection file from the newest usable snapshot.
    ///
    /// # Errors
    /// - `StoreError::NoBackupAvailable` when there is nothing to restore.
    pub async fn restore_latest(&self) -> StoreResult<PathBuf> {
        self.lock
            .with_lock(|| self.backups.restore_latest_into(&self.primary))
            .await
    }

    /// Backup snapshots, newest first.
    pub async fn snapshots(&self) -> Vec<SnapshotInfo> {
        self.backups.list().await
    }

    async fn read_or_empty(&self) -> StoreResult<Collection> {
        match self.read_collection().await {
            Err(StoreError::Io { path, source, .. }) => {
                warn!(
                    "event=load_all module=store status=error error_code=read_failed fallback=empty file={} error={}",
                    path.display(),
                    source
                );
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn read_collection(&self) -> StoreResult<Collection> {
        let bytes = tokio::fs::read(&self.primary)
            .await
            .map_err(|err| StoreError::io("read", &self.primary, err))?;

        let records: Collection =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.primary.clone(),
                source,
            })?;
        debug!(
            "event=load_all module=store status=ok records={}",
            records.len()
        );
        Ok(records)
    }

    async fn write_collection(&self, encoded: &[u8], count: usize) -> StoreResult<()> {
        let started_at = Instant::now();

        let snapshot = match self.backups.snapshot_if_present().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    "event=backup_snapshot module=store status=error error_code={} error={}",
                    err.code(),
                    err
                );
                None
            }
        };

        atomic_write(&self.primary, encoded).await?;

        if let Some(keep) = self.config.max_snapshots {
            let report = self.backups.prune_excess(keep).await;
            if report.removed > 0 {
                debug!(
                    "event=backup_retention module=store status=ok keep={} removed={}",
                    keep, report.removed
                );
            }
        }

        info!(
            "event=save_all module=store status=ok records={} snapshot={} duration_ms={}",
            count,
            snapshot.is_some(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }
}

fn encode_collection(records: &[Record]) -> StoreResult<Vec<u8>> {
    if let Some(id) = find_duplicate_id(records) {
        return Err(StoreError::DuplicateId(id.to_string()));
    }
    Ok(serde_json::to_vec_pretty(records)?)
}

#[cfg(test)]
mod tests {
    use super::RecordStore;
    use crate::config::StoreConfig;
    use crate::model::record::Record;
    use crate::storage::lock::MemoryLocker;
    use crate::storage::StoreError;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn memory_store(dir: &TempDir) -> RecordStore {
        RecordStore::with_locker(
            StoreConfig::new(dir.path()),
            Arc::new(MemoryLocker::new()),
        )
        .unwrap()
    }

    #[test]
    fn open_rejects_invalid_config() {
        let mut config = StoreConfig::new("/data");
        config.data_file_name = String::new();
        assert!(matches!(
            RecordStore::open(config),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn save_rejects_duplicate_ids_without_touching_disk() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(&dir);
        store.ensure_store().await.unwrap();

        let err = store
            .save_all(&[Record::new("a"), Record::new("a")])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateId(id) if id == "a"));
        assert!(store.snapshots().await.is_empty());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(&dir);
        store.ensure_store().await.unwrap();
        store.save_all(&[Record::new("a")]).await.unwrap();
        let snapshots_before = store.snapshots().await.len();

        let result: Result<(), StoreError> = store
            .update(|records| {
                records.clear();
                Err(StoreError::DuplicateId("forced".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.load_all().await.unwrap(), vec![Record::new("a")]);
        assert_eq!(store.snapshots().await.len(), snapshots_before);
    }

    #[tokio::test]
    async fn corrupt_primary_surfaces_on_load() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(&dir);
        store.ensure_store().await.unwrap();
        std::fs::write(store.config().data_file(), "{not json").unwrap();

        let err = store.load_all().await.unwrap_err();
        assert_eq!(err.code(), "corruption_detected");
    }

    #[tokio::test]
    async fn update_propagates_read_failure_while_load_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = memory_store(&dir);
        std::fs::create_dir(store.config().data_file()).unwrap();

        assert!(store.load_all().await.unwrap().is_empty());

        let err = store
            .update(|records| {
                records.push(Record::new("only"));
                Ok::<(), StoreError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "io_failure");
        assert!(store.config().data_file().is_dir());
    }
}
