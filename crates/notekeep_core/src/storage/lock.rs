//! Exclusive access to the collection file.
//!
//! # Responsibility
//! - Serialize collection reads and writes inside the process (async mutex
//!   per lock key) and across processes (advisory `Locker` lease).
//! - Retry contended acquisition on a bounded backoff schedule.
//!
//! # Invariants
//! - `with_lock` creates the collection file before a lease is requested.
//! - A lease is released on every exit path of the guarded operation,
//!   including cancellation, because release runs from `Drop`.
//! - Release failures are logged and never replace the operation's result.

use super::atomic::create_if_absent;
use super::{StoreError, StoreResult};
use crate::config::RetryPolicy;
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

static LOCAL_LOCKS: Lazy<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Lease acquisition/release errors.
#[derive(Debug)]
pub enum LockError {
    /// Another holder owns the lock; retryable.
    Contended(PathBuf),
    /// The lock backend failed.
    Io { key: PathBuf, source: io::Error },
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contended(key) => write!(f, "lock is held by another owner: {}", key.display()),
            Self::Io { key, source } => {
                write!(f, "lock backend failed for {}: {source}", key.display())
            }
        }
    }
}

impl Error for LockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Contended(_) => None,
        }
    }
}

/// Proof of an acquired lock, handed back to `Locker::release`.
#[derive(Debug)]
pub struct Lease {
    key: PathBuf,
    file: Option<File>,
    acquired_at: Instant,
}

impl Lease {
    fn new(key: &Path, file: Option<File>) -> Self {
        Self {
            key: key.to_path_buf(),
            file,
            acquired_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &Path {
        &self.key
    }
}

/// Advisory lock capability.
pub trait Locker: Send + Sync {
    /// Tries to take the lock for `key` without blocking.
    ///
    /// Returns `LockError::Contended` when another owner holds it.
    fn try_acquire(&self, key: &Path) -> Result<Lease, LockError>;

    /// Gives the lock back.
    fn release(&self, lease: Lease) -> Result<(), LockError>;
}

/// OS advisory file lock (`flock` on Unix, `LockFileEx` on Windows).
///
/// Locks are tied to the open file handle, so a crashed process releases
/// them automatically.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLocker;

impl Locker for FileLocker {
    fn try_acquire(&self, key: &Path) -> Result<Lease, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(key)
            .map_err(|source| LockError::Io {
                key: key.to_path_buf(),
                source,
            })?;

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Lease::new(key, Some(file))),
            Err(err) if is_contended(&err) => Err(LockError::Contended(key.to_path_buf())),
            Err(source) => Err(LockError::Io {
                key: key.to_path_buf(),
                source,
            }),
        }
    }

    fn release(&self, lease: Lease) -> Result<(), LockError> {
        let Some(file) = lease.file.as_ref() else {
            return Ok(());
        };
        fs2::FileExt::unlock(file).map_err(|source| LockError::Io {
            key: lease.key.clone(),
            source,
        })
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// In-process lock table for tests and single-process embedding.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    held: Mutex<HashSet<PathBuf>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &Path) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl Locker for MemoryLocker {
    fn try_acquire(&self, key: &Path) -> Result<Lease, LockError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.to_path_buf()) {
            return Err(LockError::Contended(key.to_path_buf()));
        }
        Ok(Lease::new(key, None))
    }

    fn release(&self, lease: Lease) -> Result<(), LockError> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&lease.key);
        Ok(())
    }
}

/// Releases the lease and the in-process mutex when dropped.
struct LockGuard {
    locker: Arc<dyn Locker>,
    lease: Option<Lease>,
    _local: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let key = lease.key.clone();
        let held_ms = lease.acquired_at.elapsed().as_millis();
        match self.locker.release(lease) {
            Ok(()) => debug!(
                "event=lock_release module=lock status=ok key={} held_ms={}",
                key.display(),
                held_ms
            ),
            Err(err) => error!(
                "event=lock_release module=lock status=error key={} held_ms={} error={}",
                key.display(),
                held_ms,
                err
            ),
        }
    }
}

/// Runs operations on the collection file one at a time.
#[derive(Clone)]
pub struct LockCoordinator {
    target: PathBuf,
    lock_key: PathBuf,
    locker: Arc<dyn Locker>,
    local: Arc<AsyncMutex<()>>,
    retry: RetryPolicy,
}

impl LockCoordinator {
    /// Coordinates access to `target` through a lease on `lock_key`.
    pub fn new(
        target: impl Into<PathBuf>,
        lock_key: impl Into<PathBuf>,
        locker: Arc<dyn Locker>,
        retry: RetryPolicy,
    ) -> Self {
        let lock_key = lock_key.into();
        let local = local_mutex_for(&lock_key);
        Self {
            target: target.into(),
            lock_key,
            locker,
            local,
            retry,
        }
    }

    pub fn lock_key(&self) -> &Path {
        &self.lock_key
    }

    /// Runs `operation` while holding the exclusive lock.
    ///
    /// # Errors
    /// - `StoreError::LockAcquisition` when the lease stays contended for the
    ///   whole retry schedule; `operation` does not run.
    /// - `StoreError::Io` when the placeholder file or the lock backend fails.
    /// - Any error returned by `operation`, unchanged.
    pub async fn with_lock<T, F, Fut>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let exists = tokio::fs::try_exists(&self.target)
            .await
            .map_err(|err| StoreError::io("stat", &self.target, err))?;
        if !exists && create_if_absent(&self.target, b"[]").await? {
            debug!(
                "event=lock_placeholder module=lock status=ok file={}",
                self.target.display()
            );
        }

        self.with_exclusive(operation).await
    }

    /// Runs `operation` while holding the exclusive lock, without creating
    /// the collection file first.
    ///
    /// Used by startup repair, which decides itself how a missing file is
    /// initialized.
    pub async fn with_exclusive<T, F, Fut>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let guard = self.acquire().await?;
        let result = operation().await;
        drop(guard);
        result
    }

    async fn acquire(&self) -> StoreResult<LockGuard> {
        let started_at = Instant::now();
        let local = Arc::clone(&self.local).lock_owned().await;
        let mut delays = self.retry.delays().into_iter();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.locker.try_acquire(&self.lock_key) {
                Ok(lease) => {
                    debug!(
                        "event=lock_acquire module=lock status=ok key={} attempt={} wait_ms={}",
                        self.lock_key.display(),
                        attempt,
                        started_at.elapsed().as_millis()
                    );
                    return Ok(LockGuard {
                        locker: Arc::clone(&self.locker),
                        lease: Some(lease),
                        _local: local,
                    });
                }
                Err(LockError::Contended(_)) => match delays.next() {
                    Some(delay) => {
                        debug!(
                            "event=lock_acquire module=lock status=retry key={} attempt={} delay_ms={}",
                            self.lock_key.display(),
                            attempt,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(
                            "event=lock_acquire module=lock status=error key={} attempts={} error_code=lock_acquisition_failed",
                            self.lock_key.display(),
                            attempt
                        );
                        return Err(StoreError::LockAcquisition {
                            path: self.target.clone(),
                            attempts: attempt,
                        });
                    }
                },
                Err(LockError::Io { key, source }) => {
                    return Err(StoreError::io("lock", key, source));
                }
            }
        }
    }
}

fn local_mutex_for(key: &Path) -> Arc<AsyncMutex<()>> {
    let mut registry = LOCAL_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(
        registry
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
    )
}

#[cfg(test)]
mod tests {
    use super::{FileLocker, LockCoordinator, LockError, Locker, MemoryLocker};
    use crate::config::RetryPolicy;
    use crate::storage::{StoreError, StoreResult};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 1.5,
        }
    }

    #[test]
    fn memory_locker_rejects_second_holder_until_release() {
        let locker = MemoryLocker::new();
        let key = std::path::Path::new("/data/notes.json.lock");

        let lease = locker.try_acquire(key).unwrap();
        assert!(matches!(
            locker.try_acquire(key),
            Err(LockError::Contended(_))
        ));
        locker.release(lease).unwrap();
        assert!(!locker.is_held(key));
        assert!(locker.try_acquire(key).is_ok());
    }

    #[test]
    fn file_locker_excludes_second_handle() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("notes.json.lock");

        let lease = FileLocker.try_acquire(&key).unwrap();
        assert!(matches!(
            FileLocker.try_acquire(&key),
            Err(LockError::Contended(_))
        ));
        FileLocker.release(lease).unwrap();
        let again = FileLocker.try_acquire(&key).unwrap();
        assert_eq!(again.key(), key.as_path());
    }

    #[tokio::test]
    async fn with_lock_creates_placeholder_and_releases_after_error() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("notes.json");
        let key = dir.path().join("notes.json.lock");
        let locker = Arc::new(MemoryLocker::new());
        let coordinator = LockCoordinator::new(&target, &key, locker.clone(), fast_retry());

        let result: Result<(), StoreError> = coordinator
            .with_lock(|| async { Err(StoreError::DuplicateId("x".to_string())) })
            .await;

        assert!(matches!(result, Err(StoreError::DuplicateId(_))));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "[]");
        assert!(!locker.is_held(&key));
    }

    #[tokio::test]
    async fn contended_lock_fails_after_bounded_attempts() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("notes.json");
        let key = dir.path().join("notes.json.lock");
        let locker = Arc::new(MemoryLocker::new());
        let _held = locker.try_acquire(&key).unwrap();
        let coordinator = LockCoordinator::new(&target, &key, locker.clone(), fast_retry());

        let mut ran = false;
        let err = coordinator
            .with_lock(|| {
                ran = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert!(!ran);
        assert!(matches!(
            err,
            StoreError::LockAcquisition { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn aborted_operation_releases_lock() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("notes.json");
        let key = dir.path().join("notes.json.lock");
        let locker = Arc::new(MemoryLocker::new());
        let coordinator = LockCoordinator::new(&target, &key, locker.clone(), fast_retry());
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .with_lock(|| async move {
                        let _ = entered_tx.send(());
                        std::future::pending::<StoreResult<()>>().await
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();
        assert!(locker.is_held(&key));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(!locker.is_held(&key));
        let value = coordinator.with_lock(|| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn with_exclusive_does_not_create_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("notes.json");
        let key = dir.path().join("notes.json.lock");
        let coordinator =
            LockCoordinator::new(&target, &key, Arc::new(MemoryLocker::new()), fast_retry());

        coordinator.with_exclusive(|| async { Ok(()) }).await.unwrap();

        assert!(!target.exists());
    }
}
