//! Atomic whole-file replacement.
//!
//! # Responsibility
//! - Replace a file's content so observers see either the old or the new
//!   bytes, never a prefix of the new ones.
//!
//! # Invariants
//! - Content is staged in a dot-prefixed `.tmp` sibling in the target's
//!   directory and fsynced before the rename.
//! - A failed stage leaves the target untouched.
//! - A staged file that is never committed is a harmless crash artifact;
//!   `sweep_stale_temp_files` removes such leftovers.

use super::{StoreError, StoreResult};
use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const TEMP_SUFFIX: &str = ".tmp";

/// Content written to a temp sibling and waiting for its rename.
#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    /// Path of the staged temp file.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Target path the commit renames onto.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Renames the staged file onto its target.
    ///
    /// # Errors
    /// - Returns `StoreError::Io` when the rename fails. The temp file is
    ///   removed best-effort in that case.
    pub async fn commit(self) -> StoreResult<()> {
        if let Err(err) = tokio::fs::rename(&self.temp_path, &self.target).await {
            let _ = tokio::fs::remove_file(&self.temp_path).await;
            return Err(StoreError::io("rename", &self.target, err));
        }

        #[cfg(unix)]
        {
            if let Some(parent) = self.target.parent() {
                if let Ok(dir) = tokio::fs::File::open(parent).await {
                    let _ = dir.sync_all().await;
                }
            }
        }

        Ok(())
    }
}

/// Writes `content` to a fresh temp sibling of `target` without touching
/// `target` itself.
///
/// # Errors
/// - Returns `StoreError::Io` when the temp file cannot be created, written
///   or synced. A partially written temp file is removed best-effort.
pub async fn stage_write(target: &Path, content: &[u8]) -> StoreResult<StagedWrite> {
    let temp_path = temp_sibling(target);

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|err| StoreError::io("create temp file", &temp_path, err))?;

    let written = async {
        file.write_all(content).await?;
        file.sync_all().await
    }
    .await;

    if let Err(err) = written {
        drop(file);
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(StoreError::io("write temp file", &temp_path, err));
    }

    Ok(StagedWrite {
        temp_path,
        target: target.to_path_buf(),
    })
}

/// Replaces `target` with `content` atomically.
pub async fn atomic_write(target: &Path, content: &[u8]) -> StoreResult<()> {
    stage_write(target, content).await?.commit().await
}

/// Creates `target` with `content` only if it does not exist yet.
///
/// The content is staged first and hard-linked into place, so the file
/// appears fully written and an existing file is never replaced. Returns
/// whether this call created the file.
pub async fn create_if_absent(target: &Path, content: &[u8]) -> StoreResult<bool> {
    let staged = stage_write(target, content).await?;
    let linked = tokio::fs::hard_link(&staged.temp_path, target).await;
    let _ = tokio::fs::remove_file(&staged.temp_path).await;

    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(StoreError::io("link", target, err)),
    }
}

/// Removes temp files left behind by interrupted writes in `dir`.
///
/// Only dot-prefixed `.tmp` files older than `min_age` are removed so that a
/// write in flight in another process is left alone. Returns the number of
/// removed files; unreadable directories count as zero.
pub async fn sweep_stale_temp_files(dir: &Path, min_age: Duration) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_temp_name(name) {
            continue;
        }

        let old_enough = match entry.metadata().await.and_then(|meta| meta.modified()) {
            Ok(modified) => now
                .duration_since(modified)
                .map(|age| age >= min_age)
                .unwrap_or(false),
            Err(_) => false,
        };
        if !old_enough {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                removed += 1;
                debug!(
                    "event=temp_sweep module=storage status=ok file={}",
                    entry.path().display()
                );
            }
            Err(err) => warn!(
                "event=temp_sweep module=storage status=error file={} error={}",
                entry.path().display(),
                err
            ),
        }
    }

    removed
}

fn temp_sibling(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    target.with_file_name(format!(".{file_name}.{}{TEMP_SUFFIX}", Uuid::new_v4()))
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}
