// TaskSupervisor: fire-and-forget work that is never lost silently
//
// Every launched operation runs on its own Tokio task under a shared
// cancellation token. Errors and panics are reported to telemetry as
// `BackgroundTaskFailure`; cancellation is silent.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::audio::CancelToken;
use crate::error::{log_task_failure, BackgroundTaskFailure};
use crate::telemetry::{LifecyclePhase, TelemetryHub};

/// Identifier returned by [`TaskSupervisor::launch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

struct TaskEntry {
    name: String,
    handle: JoinHandle<()>,
}

type TaskMap = Arc<Mutex<HashMap<u64, TaskEntry>>>;

pub struct TaskSupervisor {
    root: CancelToken,
    tasks: TaskMap,
    next_id: AtomicU64,
    telemetry: Arc<TelemetryHub>,
}

impl TaskSupervisor {
    pub fn new(telemetry: Arc<TelemetryHub>) -> Self {
        Self {
            root: CancelToken::new(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            telemetry,
        }
    }

    /// Token cancelled by [`cancel_all`](Self::cancel_all), for operations
    /// that want to check for shutdown between steps.
    pub fn token(&self) -> CancelToken {
        self.root.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Number of launched operations that have not settled yet.
    pub fn outstanding(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Launch `operation` in the background.
    ///
    /// The operation is dropped at its next await point once the supervisor
    /// is cancelled. After [`cancel_all`](Self::cancel_all) new operations
    /// are cancelled before they run.
    pub fn launch<F>(&self, name: impl Into<String>, operation: F) -> TaskId
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let token = self.root.clone();
        let telemetry = Arc::clone(&self.telemetry);
        let tasks = Arc::clone(&self.tasks);
        let task_name = name.clone();

        // Held across spawn so the task cannot deregister before it is registered.
        let mut registry = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(operation).catch_unwind() => Some(result),
            };

            let failure = match outcome {
                None => {
                    debug!("[TaskSupervisor] '{}' cancelled", task_name);
                    None
                }
                Some(Ok(Ok(()))) => {
                    debug!("[TaskSupervisor] '{}' completed", task_name);
                    None
                }
                Some(Ok(Err(err))) => Some(BackgroundTaskFailure::Failed {
                    task: task_name.clone(),
                    reason: format!("{:#}", err),
                }),
                Some(Err(panic)) => Some(BackgroundTaskFailure::Panicked {
                    task: task_name.clone(),
                    reason: panic_message(panic.as_ref()),
                }),
            };
            if let Some(failure) = failure {
                log_task_failure(&failure, "launch");
                telemetry.record_task_failure(&failure);
            }

            lock(&tasks).remove(&id);
        });
        registry.insert(id, TaskEntry { name, handle });
        TaskId(id)
    }

    /// Cancel every outstanding operation and wait up to `timeout` for them
    /// to settle.
    ///
    /// Operations still running at the deadline are aborted and reported as
    /// [`BackgroundTaskFailure::Abandoned`].
    ///
    /// # Returns
    /// Number of abandoned operations.
    pub async fn cancel_all(&self, timeout: Duration) -> usize {
        self.root.cancel();
        let mut pending: Vec<TaskEntry> =
            lock(&self.tasks).drain().map(|(_, entry)| entry).collect();
        info!(
            "[TaskSupervisor] Cancelling {} outstanding task(s)",
            pending.len()
        );

        let settle = futures::future::join_all(pending.iter_mut().map(|entry| &mut entry.handle));
        if tokio::time::timeout(timeout, settle).await.is_err() {
            warn!(
                "[TaskSupervisor] Tasks did not settle within {:?}",
                timeout
            );
        }

        let mut abandoned = 0;
        for entry in pending {
            if entry.handle.is_finished() {
                continue;
            }
            entry.handle.abort();
            abandoned += 1;
            let failure = BackgroundTaskFailure::Abandoned { task: entry.name };
            log_task_failure(&failure, "cancel_all");
            self.telemetry.record_task_failure(&failure);
        }

        self.telemetry.record_lifecycle(LifecyclePhase::TasksCancelled);
        abandoned
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MetricEvent;
    use anyhow::anyhow;

    fn failures(telemetry: &TelemetryHub) -> Vec<(String, i32)> {
        telemetry
            .snapshot()
            .recent
            .into_iter()
            .filter_map(|event| match event {
                MetricEvent::BackgroundTaskFailure { task, code, .. } => Some((task, code)),
                _ => None,
            })
            .collect()
    }

    async fn explode() -> anyhow::Result<()> {
        panic!("exploded")
    }

    async fn settle(supervisor: &TaskSupervisor) {
        for _ in 0..100 {
            if supervisor.outstanding() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_reported() {
        let telemetry = Arc::new(TelemetryHub::default());
        let supervisor = TaskSupervisor::new(Arc::clone(&telemetry));

        supervisor.launch("ok", async { Ok(()) });
        supervisor.launch("save", async { Err(anyhow!("disk full")) });
        supervisor.launch("boom", explode());
        settle(&supervisor).await;

        let mut reported = failures(&telemetry);
        reported.sort();
        assert_eq!(
            reported,
            vec![("boom".to_string(), 5002), ("save".to_string(), 5001)]
        );
    }

    #[tokio::test]
    async fn test_cancellation_is_silent() {
        let telemetry = Arc::new(TelemetryHub::default());
        let supervisor = TaskSupervisor::new(Arc::clone(&telemetry));
        supervisor.launch("narration", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        assert_eq!(supervisor.outstanding(), 1);

        let abandoned = supervisor.cancel_all(Duration::from_millis(200)).await;
        assert_eq!(abandoned, 0);
        assert_eq!(supervisor.outstanding(), 0);
        assert!(failures(&telemetry).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stuck_task_is_abandoned_at_deadline() {
        let telemetry = Arc::new(TelemetryHub::default());
        let supervisor = TaskSupervisor::new(Arc::clone(&telemetry));
        supervisor.launch("spin", async {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abandoned = supervisor.cancel_all(Duration::from_millis(30)).await;
        assert_eq!(abandoned, 1);
        assert_eq!(failures(&telemetry), vec![("spin".to_string(), 5003)]);
    }

    #[tokio::test]
    async fn test_launch_after_cancel_all_does_not_run() {
        let supervisor = TaskSupervisor::new(Arc::new(TelemetryHub::default()));
        supervisor.cancel_all(Duration::from_millis(10)).await;

        let ran = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&ran);
        supervisor.launch("late", async move {
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        settle(&supervisor).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
