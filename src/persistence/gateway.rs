//! PersistenceGateway: single-writer access to the progress store.
//!
//! Every mutation takes the writer lock (a fair Tokio mutex, so writers are
//! served in arrival order), applies its change to a copy of the committed
//! record and commits the copy. The committed snapshot is only replaced after
//! the store accepts the write, so a failed call never changes what readers
//! see. Reads go straight to the snapshot and never wait for the writer.
//!
//! Once a write holds the lock it runs to completion on its own task, which
//! owns the lock guard until the snapshot is published. Dropping the caller
//! only stops it from waiting for the result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::retry::RetryPolicy;
use super::store::{LevelProgress, ProgressRecord, SessionSummary, StorageEngine, StoreFault};
use crate::error::{log_persistence_error, PersistenceError};
use crate::telemetry::{Anomaly, TelemetryHub};

pub struct PersistenceGateway {
    store: Arc<dyn StorageEngine>,
    policy: RetryPolicy,
    writer: Arc<AsyncMutex<()>>,
    committed: Arc<RwLock<ProgressRecord>>,
    closed: AtomicBool,
    telemetry: Arc<TelemetryHub>,
}

impl PersistenceGateway {
    /// Open the gateway, loading the committed record from `store`.
    ///
    /// A busy store is retried with the same policy as writes.
    pub async fn open(
        store: Arc<dyn StorageEngine>,
        policy: RetryPolicy,
        telemetry: Arc<TelemetryHub>,
    ) -> Result<Self, PersistenceError> {
        let mut attempt = 0;
        let record = loop {
            attempt += 1;
            let loader = Arc::clone(&store);
            match run_blocking(move || loader.load()).await {
                Ok(record) => break record,
                Err(StoreFault::Busy) if policy.allows_retry(attempt) => {
                    let delay = policy.delay_after(attempt);
                    telemetry.record_retry(attempt, delay.as_millis() as u64);
                    tokio::time::sleep(delay).await;
                }
                Err(fault) => {
                    let err = into_error(fault, attempt);
                    log_persistence_error(&err, "open");
                    telemetry.record_persistence_failure(&err);
                    return Err(err);
                }
            }
        };

        info!(
            "[PersistenceGateway] Opened store: {} eggs, next level {}",
            record.eggs,
            record.next_level()
        );
        Ok(Self {
            store,
            policy,
            writer: Arc::new(AsyncMutex::new(())),
            committed: Arc::new(RwLock::new(record)),
            closed: AtomicBool::new(false),
            telemetry,
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Latest committed record.
    pub fn snapshot(&self) -> ProgressRecord {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_eggs(&self) -> u64 {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .eggs
    }

    pub fn get_unlocked_levels(&self) -> Vec<u32> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unlocked_levels()
    }

    pub fn next_level(&self) -> u32 {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .next_level()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Credit `amount` eggs and return the new balance.
    pub async fn add_eggs(&self, amount: u64) -> Result<u64, PersistenceError> {
        self.retry_locked("add_eggs", move |record| {
            record.eggs = record.eggs.saturating_add(amount);
            record.eggs
        })
        .await
    }

    /// Mark level `id` completed, keeping any stars already earned.
    pub async fn unlock_level(&self, id: u32) -> Result<(), PersistenceError> {
        self.retry_locked("unlock_level", move |record| {
            record.levels.entry(id).or_default().completed = true;
        })
        .await
    }

    /// Mark level `id` completed with `stars`; the best star count is kept.
    pub async fn record_progress(
        &self,
        id: u32,
        stars: u8,
    ) -> Result<LevelProgress, PersistenceError> {
        self.retry_locked("record_progress", move |record| {
            let level = record.levels.entry(id).or_default();
            level.completed = true;
            level.stars = level.stars.max(stars);
            *level
        })
        .await
    }

    /// Append a finished session to the history.
    pub async fn record_session(&self, summary: SessionSummary) -> Result<(), PersistenceError> {
        self.retry_locked("record_session", move |record| {
            record.sessions.push(summary);
        })
        .await
    }

    /// Run one mutation under the writer lock, retrying while the store is busy.
    ///
    /// `op` is applied to a fresh copy of the committed record on every
    /// attempt. The snapshot is replaced only after a successful commit.
    /// Writes queued before [`drain`](Self::drain) still run; later calls
    /// fail with [`PersistenceError::Closed`].
    pub async fn retry_locked<T, F>(&self, context: &str, op: F) -> Result<T, PersistenceError>
    where
        F: FnMut(&mut ProgressRecord) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(PersistenceError::Closed);
        }
        let writer = Arc::clone(&self.writer).lock_owned().await;

        let write = WriteTask {
            context: context.to_string(),
            store: Arc::clone(&self.store),
            committed: Arc::clone(&self.committed),
            policy: self.policy,
            telemetry: Arc::clone(&self.telemetry),
        };
        match tokio::spawn(write.run(writer, op)).await {
            Ok(result) => result,
            Err(e) => {
                let err = PersistenceError::Corrupt {
                    details: format!("{} write task failed: {}", context, e),
                };
                log_persistence_error(&err, context);
                Err(err)
            }
        }
    }

    /// Close the gateway for shutdown.
    ///
    /// New writes fail with [`PersistenceError::Closed`] from here on. Writes
    /// already queued for the writer lock run first, then the store is
    /// flushed. Returns `false` if the wait exceeded `timeout` or the flush
    /// failed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!("[PersistenceGateway] Draining writes");

        let flush = async {
            let _writer = self.writer.lock().await;
            let store = Arc::clone(&self.store);
            run_blocking(move || store.flush()).await
        };

        match tokio::time::timeout(timeout, flush).await {
            Ok(Ok(())) => {
                info!("[PersistenceGateway] Drained");
                true
            }
            Ok(Err(fault)) => {
                let err = into_error(fault, 1);
                log_persistence_error(&err, "drain");
                self.telemetry.record_persistence_failure(&err);
                false
            }
            Err(_) => {
                warn!(
                    "[PersistenceGateway] Drain exceeded {:?}, abandoning in-flight write",
                    timeout
                );
                self.telemetry
                    .record_anomaly(Anomaly::ShutdownTimeout, "persistence drain");
                false
            }
        }
    }
}

/// One mutation with everything it needs to finish without its caller.
struct WriteTask {
    context: String,
    store: Arc<dyn StorageEngine>,
    committed: Arc<RwLock<ProgressRecord>>,
    policy: RetryPolicy,
    telemetry: Arc<TelemetryHub>,
}

impl WriteTask {
    // `_writer` is held until the new snapshot is published.
    async fn run<T, F>(self, _writer: OwnedMutexGuard<()>, mut op: F) -> Result<T, PersistenceError>
    where
        F: FnMut(&mut ProgressRecord) -> T,
    {
        let context = self.context.as_str();
        let base = self
            .committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut candidate = base.clone();
            let value = op(&mut candidate);

            let store = Arc::clone(&self.store);
            let committed = run_blocking(move || store.commit(&candidate).map(|()| candidate)).await;

            match committed {
                Ok(record) => {
                    *self
                        .committed
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = record;
                    if attempt > 1 {
                        debug!(
                            "[PersistenceGateway] {} committed on attempt {}",
                            context, attempt
                        );
                    }
                    return Ok(value);
                }
                Err(StoreFault::Busy) if self.policy.allows_retry(attempt) => {
                    let delay = self.policy.delay_after(attempt);
                    debug!(
                        "[PersistenceGateway] {} store busy (attempt {}), retrying in {:?}",
                        context, attempt, delay
                    );
                    self.telemetry
                        .record_retry(attempt, delay.as_millis() as u64);
                    tokio::time::sleep(delay).await;
                }
                Err(fault) => {
                    let err = into_error(fault, attempt);
                    log_persistence_error(&err, context);
                    self.telemetry.record_persistence_failure(&err);
                    return Err(err);
                }
            }
        }
    }
}

/// Run blocking store I/O on the blocking pool and join it.
async fn run_blocking<T, F>(work: F) -> Result<T, StoreFault>
where
    F: FnOnce() -> Result<T, StoreFault> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(e) => Err(StoreFault::Corrupt(format!("store task failed: {}", e))),
    }
}

fn into_error(fault: StoreFault, attempts: u32) -> PersistenceError {
    match fault {
        StoreFault::Busy => PersistenceError::Unavailable { attempts },
        StoreFault::Corrupt(details) => PersistenceError::Corrupt { details },
        StoreFault::Denied(details) => PersistenceError::Denied { details },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::persistence::MemoryStore;
    use crate::telemetry::MetricEvent;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::from_config(&PersistenceConfig {
            max_attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 4,
        })
    }

    async fn gateway_over(store: Arc<MemoryStore>) -> (PersistenceGateway, Arc<TelemetryHub>) {
        let telemetry = Arc::new(TelemetryHub::default());
        let gateway = PersistenceGateway::open(store, fast_policy(), Arc::clone(&telemetry))
            .await
            .unwrap();
        (gateway, telemetry)
    }

    fn store_with_eggs(eggs: u64) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_record(ProgressRecord {
            eggs,
            ..ProgressRecord::default()
        }))
    }

    #[tokio::test]
    async fn test_busy_twice_then_success_commits_once() {
        let store = store_with_eggs(10);
        store.script_failures([StoreFault::Busy, StoreFault::Busy]);
        let (gateway, telemetry) = gateway_over(Arc::clone(&store)).await;

        assert_eq!(gateway.add_eggs(4).await, Ok(14));
        assert_eq!(store.commit_attempts(), 3);
        assert_eq!(store.stored().eggs, 14);
        assert_eq!(gateway.get_eggs(), 14);

        let retries = telemetry
            .snapshot()
            .recent
            .iter()
            .filter(|event| matches!(event, MetricEvent::PersistenceRetry { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_value_unchanged() {
        let store = store_with_eggs(10);
        store.fail_always(Some(StoreFault::Busy));
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;

        assert_eq!(
            gateway.add_eggs(4).await,
            Err(PersistenceError::Unavailable { attempts: 5 })
        );
        assert_eq!(store.commit_attempts(), 5);
        assert_eq!(store.stored().eggs, 10);
        assert_eq!(gateway.get_eggs(), 10);
    }

    #[tokio::test]
    async fn test_permanent_faults_are_not_retried() {
        let store = store_with_eggs(10);
        store.script_failures([StoreFault::Corrupt("bad page".to_string())]);
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;
        let err = gateway.add_eggs(1).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt { .. }));
        assert_eq!(store.commit_attempts(), 1);

        store.script_failures([StoreFault::Denied("read-only".to_string())]);
        let err = gateway.unlock_level(1).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Denied { .. }));
        assert_eq!(store.commit_attempts(), 2);
        assert_eq!(gateway.snapshot(), store.stored());
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_serialized() {
        let store = store_with_eggs(0);
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;
        let gateway = Arc::new(gateway);

        let writes = (0..20).map(|_| {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.add_eggs(1).await })
        });
        let mut balances = Vec::new();
        for write in writes {
            balances.push(write.await.unwrap().unwrap());
        }
        balances.sort_unstable();
        assert_eq!(balances, (1..=20).collect::<Vec<u64>>());
        assert_eq!(store.stored().eggs, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_do_not_wait_for_writer() {
        let store = store_with_eggs(10);
        store.set_commit_delay(Duration::from_millis(300));
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;
        let gateway = Arc::new(gateway);

        let write = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.add_eggs(5).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = tokio::time::Instant::now();
        assert_eq!(gateway.get_eggs(), 10);
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(write.await.unwrap(), Ok(15));
        assert_eq!(gateway.get_eggs(), 15);
    }

    #[tokio::test]
    async fn test_progress_and_unlocks() {
        let (gateway, _) = gateway_over(Arc::new(MemoryStore::new())).await;
        assert_eq!(gateway.next_level(), 1);

        gateway.record_progress(1, 2).await.unwrap();
        let best = gateway.record_progress(1, 1).await.unwrap();
        assert_eq!(best.stars, 2);
        gateway.unlock_level(2).await.unwrap();

        assert_eq!(gateway.next_level(), 3);
        assert_eq!(gateway.get_unlocked_levels(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_drain_closes_gateway() {
        let store = store_with_eggs(3);
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;

        assert!(gateway.drain(Duration::from_millis(200)).await);
        assert!(gateway.is_closed());
        assert_eq!(gateway.add_eggs(1).await, Err(PersistenceError::Closed));
        assert_eq!(store.stored().eggs, 3);
        assert_eq!(store.commit_attempts(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_write() {
        let store = store_with_eggs(3);
        store.set_commit_delay(Duration::from_millis(50));
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;
        let gateway = Arc::new(gateway);

        let write = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.add_eggs(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(gateway.drain(Duration::from_secs(1)).await);
        assert_eq!(write.await.unwrap(), Ok(5));
        assert_eq!(store.stored().eggs, 5);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_lose_committed_write() {
        let store = store_with_eggs(10);
        store.set_commit_delay(Duration::from_millis(50));
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;
        let gateway = Arc::new(gateway);

        let write = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.add_eggs(5).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        write.abort();
        assert!(write.await.unwrap_err().is_cancelled());

        // The next write queues behind the abandoned one and builds on it.
        assert_eq!(gateway.add_eggs(1).await, Ok(16));
        assert_eq!(store.stored().eggs, 16);
        assert_eq!(gateway.get_eggs(), 16);
    }

    #[tokio::test]
    async fn test_drain_runs_queued_writes() {
        let store = store_with_eggs(10);
        store.set_commit_delay(Duration::from_millis(50));
        let (gateway, _) = gateway_over(Arc::clone(&store)).await;
        let gateway = Arc::new(gateway);

        let writes: Vec<_> = [1, 2]
            .into_iter()
            .map(|amount| {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move { gateway.add_eggs(amount).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(gateway.drain(Duration::from_secs(2)).await);
        let mut balances = Vec::new();
        for write in writes {
            balances.push(write.await.unwrap().unwrap());
        }
        assert_eq!(balances.len(), 2);
        assert_eq!(balances.iter().max(), Some(&13));
        assert_eq!(store.stored().eggs, 13);
        assert_eq!(gateway.add_eggs(1).await, Err(PersistenceError::Closed));
    }

    #[tokio::test]
    async fn test_record_session_appends_history() {
        let (gateway, _) = gateway_over(Arc::new(MemoryStore::new())).await;
        let summary = SessionSummary {
            started_at_ms: 1_700_000_000_000,
            duration_ms: 90_000,
            attempted: 4,
            correct: 3,
        };
        gateway.record_session(summary).await.unwrap();
        gateway.record_session(summary).await.unwrap();

        let stats = gateway.snapshot().stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.attempted, 8);
        assert_eq!(stats.correct, 6);
    }
}
