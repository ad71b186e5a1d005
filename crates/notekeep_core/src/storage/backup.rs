//! Backup snapshots of the collection file.
//!
//! # Responsibility
//! - Copy the collection file into a timestamped snapshot before mutation.
//! - Locate the newest usable snapshot and restore it atomically.
//! - Housekeeping: drop degenerate snapshots, enforce retention, redact
//!   deleted records.
//!
//! # Invariants
//! - Snapshot names sort by creation time and never collide within a process
//!   (`<prefix>-<utc stamp>-<pid>-<seq>.json`).
//! - Only names matching the snapshot pattern are candidates for restore;
//!   quarantine files never are.
//! - A snapshot holding zero records is never restored.
//! - Housekeeping failures are logged and counted, never returned.

use super::atomic::atomic_write;
use super::{StoreError, StoreResult};
use crate::config::QUARANTINE_PREFIX;
use crate::model::record::{value_has_id, Collection};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::cmp::Reverse;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

static SNAPSHOT_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<prefix>.+)-(?P<stamp>\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}-\d{3}Z)-(?P<pid>\d+)-(?P<seq>\d{8,})\.json$",
    )
    .expect("valid snapshot name regex")
});

static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

const SNAPSHOT_STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// One snapshot file with its modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Outcome counters for best-effort housekeeping passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Files inspected.
    pub examined: usize,
    /// Files deleted.
    pub removed: usize,
    /// Files rewritten with filtered content.
    pub rewritten: usize,
    /// Files skipped because an I/O step failed.
    pub failed: usize,
}

/// Snapshot management for one collection file.
#[derive(Debug, Clone)]
pub struct BackupManager {
    primary: PathBuf,
    backup_dir: PathBuf,
    prefix: String,
}

impl BackupManager {
    pub fn new(
        primary: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            primary: primary.into(),
            backup_dir: backup_dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Builds the next snapshot file name for `now`.
    pub fn snapshot_name(&self, now: DateTime<Utc>) -> String {
        let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}-{:08}.json",
            self.prefix,
            now.format(SNAPSHOT_STAMP_FORMAT),
            std::process::id(),
            seq
        )
    }

    /// Returns whether `file_name` is a snapshot owned by this manager.
    pub fn is_snapshot_name(&self, file_name: &str) -> bool {
        SNAPSHOT_NAME_RE
            .captures(file_name)
            .and_then(|caps| caps.name("prefix"))
            .is_some_and(|prefix| prefix.as_str() == self.prefix)
    }

    /// Copies the current collection file into a new snapshot.
    ///
    /// Returns `Ok(None)` when there is no collection file yet. Callers treat
    /// errors as non-fatal; a failed snapshot never blocks the write.
    pub async fn snapshot_if_present(&self) -> StoreResult<Option<PathBuf>> {
        let bytes = match tokio::fs::read(&self.primary).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io("read", &self.primary, err)),
        };

        let path = self.backup_dir.join(self.snapshot_name(Utc::now()));
        atomic_write(&path, &bytes).await?;
        debug!(
            "event=backup_snapshot module=backup status=ok file={} bytes={}",
            path.display(),
            bytes.len()
        );
        Ok(Some(path))
    }

    /// Lists snapshots newest first.
    ///
    /// Ordering is by modification time, then by file name, both descending.
    /// An unreadable backups directory yields an empty list.
    pub async fn list(&self) -> Vec<SnapshotInfo> {
        let mut snapshots = Vec::new();
        for path in self.json_files().await {
            let is_snapshot = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| self.is_snapshot_name(name));
            if !is_snapshot {
                continue;
            }
            if let Ok(modified) = tokio::fs::metadata(&path)
                .await
                .and_then(|meta| meta.modified())
            {
                snapshots.push(SnapshotInfo { path, modified });
            }
        }

        snapshots.sort_by_key(|info| {
            (
                Reverse(info.modified),
                Reverse(info.path.file_name().map(|name| name.to_os_string())),
            )
        });
        snapshots
    }

    /// Path of the most recently modified snapshot.
    pub async fn latest(&self) -> Option<PathBuf> {
        self.list().await.into_iter().next().map(|info| info.path)
    }

    /// Path of the newest snapshot holding a non-empty JSON array.
    pub async fn latest_usable(&self) -> Option<PathBuf> {
        for info in self.list().await {
            match tokio::fs::read(&info.path).await {
                Ok(bytes) if holds_records(&bytes) => return Some(info.path),
                Ok(_) => debug!(
                    "event=backup_latest module=backup status=skipped reason=unusable file={}",
                    info.path.display()
                ),
                Err(err) => warn!(
                    "event=backup_latest module=backup status=error file={} error={}",
                    info.path.display(),
                    err
                ),
            }
        }
        None
    }

    /// Replaces `primary` with the newest usable snapshot.
    ///
    /// Returns the snapshot path restored from.
    ///
    /// # Errors
    /// - `StoreError::NoBackupAvailable` when no usable snapshot exists.
    /// - `StoreError::Io` when reading the snapshot or writing `primary` fails.
    pub async fn restore_latest_into(&self, primary: &Path) -> StoreResult<PathBuf> {
        let source = self
            .latest_usable()
            .await
            .ok_or_else(|| StoreError::NoBackupAvailable {
                backup_dir: self.backup_dir.clone(),
            })?;

        let bytes = tokio::fs::read(&source)
            .await
            .map_err(|err| StoreError::io("read", &source, err))?;
        atomic_write(primary, &bytes).await?;

        info!(
            "event=backup_restore module=backup status=ok source={} target={}",
            source.display(),
            primary.display()
        );
        Ok(source)
    }

    /// Deletes snapshots whose content is blank, `[]` or `{}`.
    ///
    /// Quarantine files are kept whatever they hold.
    pub async fn prune_empty(&self) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();
        for path in self.json_files().await {
            if is_quarantine_file(&path) {
                continue;
            }
            report.examined += 1;
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        "event=backup_prune_empty module=backup status=error file={} error={}",
                        path.display(),
                        err
                    );
                    continue;
                }
            };
            if !is_degenerate(&bytes) {
                continue;
            }
            self.remove(&path, "backup_prune_empty", &mut report).await;
        }

        if report.removed > 0 || report.failed > 0 {
            info!(
                "event=backup_prune_empty module=backup status=ok examined={} removed={} failed={}",
                report.examined, report.removed, report.failed
            );
        }
        report
    }

    /// Deletes the oldest snapshots so at most `keep` remain.
    pub async fn prune_excess(&self, keep: usize) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();
        let snapshots = self.list().await;
        report.examined = snapshots.len();
        for info in snapshots.into_iter().skip(keep) {
            self.remove(&info.path, "backup_prune_excess", &mut report)
                .await;
        }
        report
    }

    /// Removes every record with `id` from all snapshots.
    ///
    /// Non-array or unparseable files are skipped. A snapshot left without
    /// records is deleted; otherwise it is rewritten atomically.
    pub async fn purge_record(&self, id: &str) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();
        for path in self.json_files().await {
            report.examined += 1;
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        "event=backup_purge module=backup status=error file={} error={}",
                        path.display(),
                        err
                    );
                    continue;
                }
            };
            let Ok(Value::Array(records)) = serde_json::from_slice::<Value>(&bytes) else {
                continue;
            };

            let before = records.len();
            let kept: Vec<Value> = records
                .into_iter()
                .filter(|record| !value_has_id(record, id))
                .collect();
            if kept.len() == before {
                continue;
            }

            if kept.is_empty() {
                self.remove(&path, "backup_purge", &mut report).await;
                continue;
            }

            let rewritten = match serde_json::to_vec_pretty(&kept) {
                Ok(encoded) => atomic_write(&path, &encoded).await,
                Err(err) => Err(StoreError::from(err)),
            };
            match rewritten {
                Ok(()) => report.rewritten += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        "event=backup_purge module=backup status=error file={} error_code={} error={}",
                        path.display(),
                        err.code(),
                        err
                    );
                }
            }
        }

        info!(
            "event=backup_purge module=backup status=ok id={} examined={} removed={} rewritten={} failed={}",
            id, report.examined, report.removed, report.rewritten, report.failed
        );
        report
    }

    /// Stores corrupt collection bytes as `corrupt-<epoch ms>.json`.
    pub async fn quarantine(&self, bytes: &[u8]) -> StoreResult<PathBuf> {
        let path = self.backup_dir.join(format!(
            "{QUARANTINE_PREFIX}-{}.json",
            Utc::now().timestamp_millis()
        ));
        atomic_write(&path, bytes).await?;
        Ok(path)
    }

    async fn json_files(&self) -> Vec<PathBuf> {
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(
                    "event=backup_scan module=backup status=skipped dir={} error={}",
                    self.backup_dir.display(),
                    err
                );
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_file && !name.starts_with('.') && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
        files.sort();
        files
    }

    async fn remove(&self, path: &Path, event: &str, report: &mut HousekeepingReport) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                report.removed += 1;
                debug!(
                    "event={} module=backup status=ok action=remove file={}",
                    event,
                    path.display()
                );
            }
            Err(err) => {
                report.failed += 1;
                warn!(
                    "event={} module=backup status=error action=remove file={} error={}",
                    event,
                    path.display(),
                    err
                );
            }
        }
    }
}

fn is_quarantine_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(&format!("{QUARANTINE_PREFIX}-")))
}

/// Blank, `[]` or `{}` content.
fn is_degenerate(bytes: &[u8]) -> bool {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return true;
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Array(items)) => items.is_empty(),
        Ok(Value::Object(fields)) => fields.is_empty(),
        _ => false,
    }
}

fn holds_records(bytes: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<Collection>(bytes),
        Ok(records) if !records.is_empty()
    )
}
