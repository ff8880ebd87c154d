// InputGate: debounce guard around answer submission
//
// One gate per interaction surface. `lock()` (or `try_submit()`) closes the
// gate while an answer is evaluated; `reset_interaction()` re-arms it after
// the debounce window. The gate owns at most one re-arm timer at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::InputConfig;

struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

struct GateState {
    locked: AtomicBool,
    timer: Mutex<TimerSlot>,
    rearms: AtomicU64,
}

impl GateState {
    fn slot(&self) -> MutexGuard<'_, TimerSlot> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Debounce gate preventing a second submission while one is evaluated
///
/// # Example
/// ```ignore
/// let gate = InputGate::new(Duration::from_millis(300));
/// if gate.try_submit() {
///     evaluate(answer).await;
///     gate.reset_interaction();
/// }
/// ```
pub struct InputGate {
    state: Arc<GateState>,
    debounce: Duration,
}

impl InputGate {
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: Arc::new(GateState {
                locked: AtomicBool::new(false),
                timer: Mutex::new(TimerSlot {
                    generation: 0,
                    handle: None,
                }),
                rearms: AtomicU64::new(0),
            }),
            debounce,
        }
    }

    pub fn from_config(config: &InputConfig) -> Self {
        Self::new(Duration::from_millis(config.debounce_ms))
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn is_locked(&self) -> bool {
        self.state.locked.load(Ordering::SeqCst)
    }

    pub fn lock(&self) {
        self.state.locked.store(true, Ordering::SeqCst);
    }

    /// Lock the gate if it is open.
    ///
    /// # Returns
    /// `true` if this call closed the gate and the caller may evaluate its
    /// submission, `false` if the gate was already locked.
    pub fn try_submit(&self) -> bool {
        self.state
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Re-arm the gate after the debounce window.
    ///
    /// Any pending re-arm timer is aborted before the new one starts, so the
    /// gate never has more than one. The gate stays locked until the new
    /// timer fires. Outside a Tokio runtime the gate re-arms immediately.
    pub fn reset_interaction(&self) {
        let mut slot = self.state.slot();
        if let Some(previous) = slot.handle.take() {
            previous.abort();
            debug!("[InputGate] Replaced pending re-arm timer");
        }
        slot.generation += 1;
        let generation = slot.generation;

        let Ok(runtime) = Handle::try_current() else {
            warn!("[InputGate] No runtime for re-arm timer, re-arming now");
            self.state.locked.store(false, Ordering::SeqCst);
            self.state.rearms.fetch_add(1, Ordering::SeqCst);
            return;
        };

        let state = Arc::clone(&self.state);
        let debounce = self.debounce;
        slot.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut slot = state.slot();
            // A newer reset owns the gate now.
            if slot.generation != generation {
                return;
            }
            slot.handle = None;
            state.locked.store(false, Ordering::SeqCst);
            state.rearms.fetch_add(1, Ordering::SeqCst);
        }));
    }

    /// Number of times a re-arm timer has fired.
    pub fn rearm_count(&self) -> u64 {
        self.state.rearms.load(Ordering::SeqCst)
    }

    pub fn has_pending_timer(&self) -> bool {
        self.state
            .slot()
            .handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Abort the pending re-arm timer, leaving the lock state as is.
    pub fn cancel_timer(&self) {
        let mut slot = self.state.slot();
        slot.generation += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for InputGate {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
