//! Integration tests for the persistence gateway under store contention
//!
//! Covers transient busy failures that recover within the retry budget,
//! budgets that run out, a `.lock` file held by another writer, and a lock
//! marker left behind by a writer that died.

use std::fs::{self, File, OpenOptions};
use std::sync::Arc;
use std::time::Duration;

use omni_session::config::PersistenceConfig;
use omni_session::persistence::{RetryPolicy, StorageEngine, StoreFault};
use omni_session::telemetry::MetricEvent;
use omni_session::{
    ErrorCode, JsonFileStore, MemoryStore, PersistenceError, PersistenceGateway, ProgressRecord,
    TelemetryHub,
};

fn fast_policy() -> RetryPolicy {
    RetryPolicy::from_config(&PersistenceConfig {
        max_attempts: 5,
        base_delay_ms: 2,
        max_delay_ms: 10,
    })
}

async fn gateway_over(store: Arc<MemoryStore>, telemetry: Arc<TelemetryHub>) -> PersistenceGateway {
    PersistenceGateway::open(store, fast_policy(), telemetry)
        .await
        .unwrap()
}

fn retries(telemetry: &TelemetryHub) -> usize {
    telemetry
        .snapshot()
        .recent
        .iter()
        .filter(|event| matches!(event, MetricEvent::PersistenceRetry { .. }))
        .count()
}

#[tokio::test]
async fn test_busy_store_recovers_within_budget() {
    let store = Arc::new(MemoryStore::with_record(ProgressRecord {
        eggs: 10,
        ..ProgressRecord::default()
    }));
    let telemetry = Arc::new(TelemetryHub::default());
    let gateway = gateway_over(store.clone(), telemetry.clone()).await;

    store.script_failures([StoreFault::Busy, StoreFault::Busy]);
    assert_eq!(gateway.add_eggs(4).await.unwrap(), 14);

    assert_eq!(store.commit_attempts(), 3);
    assert_eq!(store.stored().eggs, 14);
    assert_eq!(gateway.get_eggs(), 14);
    assert_eq!(retries(&telemetry), 2);
}

#[tokio::test]
async fn test_exhausted_budget_leaves_value_unchanged() {
    let store = Arc::new(MemoryStore::with_record(ProgressRecord {
        eggs: 10,
        ..ProgressRecord::default()
    }));
    let telemetry = Arc::new(TelemetryHub::default());
    let gateway = gateway_over(store.clone(), telemetry.clone()).await;

    store.fail_always(Some(StoreFault::Busy));
    let err = gateway.add_eggs(4).await.unwrap_err();
    assert_eq!(err, PersistenceError::Unavailable { attempts: 5 });
    assert_eq!(err.code(), 4001);

    assert_eq!(store.stored().eggs, 10);
    assert_eq!(gateway.get_eggs(), 10);
    assert_eq!(retries(&telemetry), 4);

    // The next write after contention clears goes through normally.
    store.fail_always(None);
    assert_eq!(gateway.add_eggs(1).await.unwrap(), 11);
}

fn hold_lock(path: &std::path::Path) -> File {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .unwrap();
    file.try_lock().unwrap();
    file
}

#[tokio::test]
async fn test_held_lock_file_reports_busy_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let store = Arc::new(JsonFileStore::new(&path));
    let gateway = PersistenceGateway::open(
        store.clone(),
        fast_policy(),
        Arc::new(TelemetryHub::default()),
    )
    .await
    .unwrap();

    // Another writer holds the lock for the whole retry budget.
    let holder = hold_lock(store.lock_path());
    let err = gateway.add_eggs(5).await.unwrap_err();
    assert_eq!(err, PersistenceError::Unavailable { attempts: 5 });
    assert!(!path.exists());

    // Released shortly after the first attempt: the retry succeeds.
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3)).await;
        drop(holder);
    });
    let slow_policy = RetryPolicy::from_config(&PersistenceConfig {
        max_attempts: 5,
        base_delay_ms: 10,
        max_delay_ms: 40,
    });
    let patient = PersistenceGateway::open(
        store.clone(),
        slow_policy,
        Arc::new(TelemetryHub::default()),
    )
    .await
    .unwrap();
    assert_eq!(patient.add_eggs(5).await.unwrap(), 5);
    releaser.await.unwrap();

    let on_disk: ProgressRecord =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk.eggs, 5);
    assert!(patient.drain(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_marker_left_by_dead_writer_does_not_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    let store = Arc::new(JsonFileStore::new(&path));
    fs::write(store.lock_path(), b"").unwrap();

    let gateway = PersistenceGateway::open(
        store.clone(),
        fast_policy(),
        Arc::new(TelemetryHub::default()),
    )
    .await
    .unwrap();
    assert_eq!(gateway.add_eggs(3).await.unwrap(), 3);
    assert_eq!(gateway.add_eggs(4).await.unwrap(), 7);
    assert!(gateway.drain(Duration::from_millis(200)).await);

    let reopened = JsonFileStore::new(&path);
    assert_eq!(reopened.load().unwrap().eggs, 7);
}

#[tokio::test]
async fn test_corrupt_document_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");
    fs::write(&path, "{ not json").unwrap();

    let result = PersistenceGateway::open(
        Arc::new(JsonFileStore::new(&path)),
        fast_policy(),
        Arc::new(TelemetryHub::default()),
    )
    .await;
    assert!(matches!(result, Err(PersistenceError::Corrupt { .. })));
}
