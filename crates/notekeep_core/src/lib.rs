//! Persistence core for the notekeep note service.
//! Owns the JSON collection file: atomic writes, backups, locking and repair.

pub mod config;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod storage;

pub use config::{RetryPolicy, StoreConfig};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::note::Note;
pub use model::record::{Collection, Record, RecordId};
pub use repo::record_store::RecordStore;
pub use service::note_service::{NoteService, NoteServiceError};
pub use storage::backup::{HousekeepingReport, SnapshotInfo};
pub use storage::integrity::StoreHealth;
pub use storage::lock::{FileLocker, LockError, Locker, MemoryLocker};
pub use storage::{StoreError, StoreResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
