//! Director: the finite-state authority over the session's UI mode.
//!
//! Every state change goes through [`Director::set_state`]. Requests are
//! serialized through a fair async mutex, so calls that arrive while a
//! transition's exit/entry actions are running wait their turn in FIFO order
//! and transitions never interleave.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::BoxFuture;
use log::{debug, info};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{log_transition_error, InvalidTransition};
use crate::telemetry::TelemetryHub;

mod state;

pub use state::{AppState, TransitionEffect, TransitionTable};

/// A committed state change, delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: AppState,
    pub to: AppState,
    /// Number of transitions applied so far, including this one
    pub sequence: u64,
}

/// Callback invoked after each committed transition.
pub type TransitionObserver = Arc<dyn Fn(&StateTransition) + Send + Sync>;

/// Entry/exit actions run around each committed transition.
///
/// Implemented by the audio coordinator to drive music ducking; tests supply
/// recording doubles.
pub trait TransitionHooks: Send + Sync {
    /// Runs before `from` is left.
    fn on_exit(&self, from: AppState, effect: TransitionEffect) -> BoxFuture<'_, ()>;

    /// Runs after `to` is committed.
    fn on_entry(&self, to: AppState, effect: TransitionEffect) -> BoxFuture<'_, ()>;
}

/// Hooks that do nothing.
pub struct NoopHooks;

impl TransitionHooks for NoopHooks {
    fn on_exit(&self, _from: AppState, _effect: TransitionEffect) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_entry(&self, _to: AppState, _effect: TransitionEffect) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Clears the in-progress flag even if the transition future is dropped.
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Director {
    state: RwLock<AppState>,
    table: TransitionTable,
    hooks: Arc<dyn TransitionHooks>,
    serial: AsyncMutex<()>,
    in_progress: AtomicBool,
    sequence: AtomicU64,
    observers: Mutex<Vec<TransitionObserver>>,
    telemetry: Arc<TelemetryHub>,
}

impl Director {
    /// Create a Director in `Idle` with the standard transition table.
    pub fn new(hooks: Arc<dyn TransitionHooks>, telemetry: Arc<TelemetryHub>) -> Self {
        Self::with_table(
            AppState::Idle,
            TransitionTable::standard(),
            hooks,
            telemetry,
        )
    }

    pub fn with_table(
        initial: AppState,
        table: TransitionTable,
        hooks: Arc<dyn TransitionHooks>,
        telemetry: Arc<TelemetryHub>,
    ) -> Self {
        Self {
            state: RwLock::new(initial),
            table,
            hooks,
            serial: AsyncMutex::new(()),
            in_progress: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
            telemetry,
        }
    }

    pub fn current_state(&self) -> AppState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether exit/entry actions of some transition are running right now.
    pub fn is_transitioning(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Number of transitions applied since construction.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Request a transition to `new`.
    ///
    /// Same-state requests are absorbed without running any action. Pairs
    /// missing from the table fail with [`InvalidTransition`] and leave the
    /// state untouched.
    pub async fn set_state(&self, new: AppState) -> Result<(), InvalidTransition> {
        let _turn = self.serial.lock().await;
        self.apply(new).await
    }

    /// Apply `new` only if `guard` accepts the state and sequence observed
    /// once this request reaches the front of the queue.
    ///
    /// Returns `Ok(false)` when the guard declines. Timers use this so a
    /// stale deadline cannot act on a state that has since been left.
    pub async fn transition_if<F>(&self, guard: F, new: AppState) -> Result<bool, InvalidTransition>
    where
        F: FnOnce(AppState, u64) -> bool + Send,
    {
        let _turn = self.serial.lock().await;
        if !guard(self.current_state(), self.sequence()) {
            return Ok(false);
        }
        self.apply(new).await.map(|()| true)
    }

    /// Tap-to-skip: leave narration or celebration for input.
    pub async fn force_skip(&self) -> Result<bool, InvalidTransition> {
        let skipped = self
            .transition_if(
                |state, _| matches!(state, AppState::TutorSpeaking | AppState::Celebration),
                AppState::InputActive,
            )
            .await?;
        if skipped {
            info!("[Director] Skip accepted");
        }
        Ok(skipped)
    }

    /// Register an observer called after every committed transition.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    // Caller holds `serial`.
    async fn apply(&self, new: AppState) -> Result<(), InvalidTransition> {
        let current = self.current_state();
        if current == new {
            debug!("[Director] Already in {:?}, ignoring", new);
            return Ok(());
        }

        let effect = match self.table.lookup(current, new) {
            Some(effect) => effect,
            None => {
                let err = InvalidTransition {
                    from: current,
                    to: new,
                };
                log_transition_error(&err, "set_state");
                return Err(err);
            }
        };

        let transition = {
            let _in_progress = InProgress::enter(&self.in_progress);
            self.hooks.on_exit(current, effect).await;
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = new;
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            self.hooks.on_entry(new, effect).await;
            StateTransition {
                from: current,
                to: new,
                sequence,
            }
        };

        debug!("[Director] {:?} -> {:?}", current, new);
        self.telemetry.record_transition(current, new);
        self.notify(&transition);
        Ok(())
    }

    fn notify(&self, transition: &StateTransition) {
        // Snapshot so observers may subscribe further observers.
        let observers: Vec<TransitionObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(transition);
        }
    }
}
