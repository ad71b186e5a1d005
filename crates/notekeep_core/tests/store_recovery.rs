use chrono::{Duration as ChronoDuration, Utc};
use notekeep_core::storage::atomic::stage_write;
use notekeep_core::{
    FileLocker, Locker, MemoryLocker, Record, RecordStore, RetryPolicy, StoreConfig, StoreError,
    StoreHealth,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> RecordStore {
    RecordStore::with_locker(StoreConfig::new(dir.path()), Arc::new(MemoryLocker::new())).unwrap()
}

fn write_snapshot(store: &RecordStore, minutes_ago: i64, content: &str) -> std::path::PathBuf {
    let name = store
        .backups()
        .snapshot_name(Utc::now() - ChronoDuration::minutes(minutes_ago));
    let path = store.config().backup_dir().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn ensure_store_twice_leaves_healthy_file_unchanged() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    assert_eq!(
        store.ensure_store().await.unwrap(),
        StoreHealth::EmptyInitialized
    );
    store
        .save_all(&[Record::new("1").with_field("title", "a")])
        .await
        .unwrap();
    let before = std::fs::read(store.config().data_file()).unwrap();

    assert_eq!(store.ensure_store().await.unwrap(), StoreHealth::Healthy);
    assert_eq!(store.ensure_store().await.unwrap(), StoreHealth::Healthy);

    assert_eq!(std::fs::read(store.config().data_file()).unwrap(), before);
}

#[tokio::test]
async fn corrupt_primary_is_restored_from_backup() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();

    let backup_content = r#"[{"id":"1","title":"a","text":"b"}]"#;
    let snapshot = write_snapshot(&store, 1, backup_content);
    std::fs::write(store.config().data_file(), "{not json").unwrap();

    let health = store.ensure_store().await.unwrap();

    assert_eq!(health, StoreHealth::Restored { from: snapshot });
    assert_eq!(
        std::fs::read_to_string(store.config().data_file()).unwrap(),
        backup_content
    );
    let loaded = store.load_all().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].get_str("text"), Some("b"));
}

#[tokio::test]
async fn corrupt_primary_without_backup_is_quarantined_and_reset() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    std::fs::write(store.config().data_file(), "{not json").unwrap();

    let health = store.ensure_store().await.unwrap();

    let StoreHealth::ResetEmpty {
        quarantined: Some(quarantine),
    } = &health
    else {
        panic!("expected reset with quarantine, got {health:?}");
    };
    assert_eq!(
        std::fs::read_to_string(store.config().data_file()).unwrap(),
        "[]"
    );
    assert_eq!(quarantine.parent(), Some(store.config().backup_dir().as_path()));
    assert!(quarantine
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("corrupt-"));
    assert_eq!(std::fs::read_to_string(quarantine).unwrap(), "{not json");
}

#[tokio::test]
async fn restore_skips_newer_unusable_snapshot() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();

    let good = write_snapshot(&store, 10, r#"[{"id":"old"}]"#);
    let broken = write_snapshot(&store, 1, "{broken");
    assert_eq!(store.backups().latest().await, Some(broken));

    std::fs::write(store.config().data_file(), "").unwrap();
    let health = store.ensure_store().await.unwrap();

    assert_eq!(health, StoreHealth::Restored { from: good });
    assert_eq!(store.load_all().await.unwrap(), vec![Record::new("old")]);
}

#[tokio::test]
async fn explicit_restore_without_backup_fails() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();

    let err = store.restore_latest().await.unwrap_err();

    assert!(matches!(err, StoreError::NoBackupAvailable { .. }));
    assert_eq!(
        std::fs::read_to_string(store.config().data_file()).unwrap(),
        "[]"
    );
}

#[tokio::test]
async fn explicit_restore_rolls_back_last_save() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    store.save_all(&[Record::new("a")]).await.unwrap();
    store
        .save_all(&[Record::new("a"), Record::new("b")])
        .await
        .unwrap();

    store.restore_latest().await.unwrap();

    assert_eq!(store.load_all().await.unwrap(), vec![Record::new("a")]);
}

#[tokio::test]
async fn interrupted_write_never_changes_primary() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    store.save_all(&[Record::new("kept")]).await.unwrap();
    let before = std::fs::read(store.config().data_file()).unwrap();

    // Crash between temp write and rename: the staged file is never committed.
    let staged = stage_write(&store.config().data_file(), br#"[{"id":"lost"}"#)
        .await
        .unwrap();

    assert!(staged.temp_path().exists());
    assert_eq!(std::fs::read(store.config().data_file()).unwrap(), before);
    assert_eq!(store.ensure_store().await.unwrap(), StoreHealth::Healthy);
    assert_eq!(store.load_all().await.unwrap(), vec![Record::new("kept")]);
}

#[tokio::test]
async fn prune_empty_removes_only_degenerate_snapshots() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    let backup_dir = store.config().backup_dir();
    std::fs::write(backup_dir.join("notes-empty.json"), "[]").unwrap();
    std::fs::write(backup_dir.join("notes-blank.json"), "  \n").unwrap();
    std::fs::write(backup_dir.join("notes-object.json"), "{}").unwrap();
    std::fs::write(backup_dir.join("notes-kept.json"), r#"[{"id":"x"}]"#).unwrap();

    let report = store.backups().prune_empty().await;

    assert_eq!(report.removed, 3);
    assert!(!backup_dir.join("notes-empty.json").exists());
    assert!(!backup_dir.join("notes-blank.json").exists());
    assert!(!backup_dir.join("notes-object.json").exists());
    assert!(backup_dir.join("notes-kept.json").exists());
}

#[tokio::test]
async fn retention_keeps_newest_snapshots() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::with_locker(
        StoreConfig::new(dir.path()).with_max_snapshots(Some(2)),
        Arc::new(MemoryLocker::new()),
    )
    .unwrap();
    store.ensure_store().await.unwrap();

    for index in 0..5 {
        let records: Vec<Record> = (0..=index)
            .map(|id| Record::new(id.to_string()))
            .collect();
        store.save_all(&records).await.unwrap();
    }

    assert_eq!(store.snapshots().await.len(), 2);
    assert_eq!(store.load_all().await.unwrap().len(), 5);
}

#[tokio::test]
async fn array_of_non_records_is_restored_from_backup() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    write_snapshot(&store, 2, r#"[{"id":"good","title":"a"}]"#);
    write_snapshot(&store, 1, r#"[{"id":9}]"#);
    std::fs::write(store.config().data_file(), r#"[{"id":7,"title":"a"}]"#).unwrap();

    let health = store.ensure_store().await.unwrap();

    assert!(matches!(health, StoreHealth::Restored { .. }));
    let records = store.load_all().await.unwrap();
    assert_eq!(records, vec![Record::new("good").with_field("title", "a")]);
}

#[tokio::test]
async fn array_without_ids_is_quarantined_and_reset() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    let corrupt = r#"[{"title":"x"}]"#;
    std::fs::write(store.config().data_file(), corrupt).unwrap();

    let health = store.ensure_store().await.unwrap();

    let StoreHealth::ResetEmpty {
        quarantined: Some(quarantine),
    } = &health
    else {
        panic!("unexpected health: {health:?}");
    };
    assert_eq!(std::fs::read_to_string(quarantine).unwrap(), corrupt);
    assert!(store.load_all().await.unwrap().is_empty());
    store.save_all(&[Record::new("fresh")]).await.unwrap();
}

#[tokio::test]
async fn startup_repair_waits_for_lock_holder() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path()).with_lock_retry(RetryPolicy {
        attempts: 2,
        initial_delay: Duration::from_millis(5),
        multiplier: 1.5,
    });
    let store = RecordStore::open(config.clone()).unwrap();
    std::fs::write(config.data_file(), "{torn").unwrap();

    let lease = FileLocker.try_acquire(&config.lock_file()).unwrap();
    let err = store.ensure_store().await.unwrap_err();

    assert!(matches!(err, StoreError::LockAcquisition { .. }));
    assert_eq!(std::fs::read_to_string(config.data_file()).unwrap(), "{torn");
    assert!(config.backup_dir().is_dir());

    FileLocker.release(lease).unwrap();
    let health = store.ensure_store().await.unwrap();
    assert!(matches!(health, StoreHealth::ResetEmpty { .. }));
}

#[tokio::test]
async fn quarantined_empty_file_survives_next_startup() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    std::fs::write(store.config().data_file(), "").unwrap();

    let health = store.ensure_store().await.unwrap();
    let StoreHealth::ResetEmpty {
        quarantined: Some(quarantine),
    } = &health
    else {
        panic!("unexpected health: {health:?}");
    };

    assert_eq!(store.ensure_store().await.unwrap(), StoreHealth::Healthy);
    assert!(quarantine.exists());
    assert!(std::fs::read(quarantine).unwrap().is_empty());
}

#[tokio::test]
async fn save_succeeds_when_snapshot_cannot_be_written() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.ensure_store().await.unwrap();
    store.save_all(&[Record::new("old")]).await.unwrap();
    std::fs::remove_dir_all(store.config().backup_dir()).unwrap();

    store.save_all(&[Record::new("new")]).await.unwrap();

    assert_eq!(store.load_all().await.unwrap(), vec![Record::new("new")]);
    assert!(store.snapshots().await.is_empty());
}

