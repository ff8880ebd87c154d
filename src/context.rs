// SessionContext: single owner of the session's components
//
// Built once per session and passed by reference. Presentation code talks to
// it through `dispatch(SessionEvent)`; the Director's entry/exit actions are
// wired to the AudioCoordinator through `TransitionHooks`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::audio::voice_bank::{self, FAREWELL, LEVEL_INTRO, WELCOME};
use crate::audio::{AudioCoordinator, AudioPort, PlaybackOutcome, VoiceBank};
use crate::config::SessionConfig;
use crate::director::{AppState, Director, StateTransition};
use crate::error::{log_playback_error, PersistenceError, SessionError};
use crate::input::InputGate;
use crate::persistence::{PersistenceGateway, RetryPolicy, SessionSummary, StorageEngine};
use crate::tasks::TaskSupervisor;
use crate::telemetry::{Anomaly, LifecyclePhase, TelemetryHub};

/// Sound effect played when a correct answer earns its reward
pub const REWARD_EFFECT: &str = "reward";

/// Wrong attempts on one level before the tutor adds a hint
pub const HINT_AFTER_ATTEMPTS: u32 = 2;

/// Events the presentation layer feeds into the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    LevelSelected(u32),
    AnswerSubmitted { correct: bool },
    SkipRequested,
    BackToMap,
}

/// How a dispatched event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied,
    /// Ignored in the current state (locked gate, level not unlocked, ...)
    Rejected,
}

/// Answers given since `Start`, saved to the history at shutdown.
#[derive(Debug)]
struct SessionTally {
    started_at_ms: u64,
    started: Instant,
    attempted: u32,
    correct: u32,
}

/// What shutdown managed to finish within its deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub abandoned_tasks: usize,
    pub persistence_drained: bool,
}

#[derive(Debug, Default)]
struct RoundState {
    level: Option<u32>,
    attempts: u32,
    streak: u32,
}

pub struct SessionContext {
    config: SessionConfig,
    telemetry: Arc<TelemetryHub>,
    audio: Arc<AudioCoordinator>,
    director: Arc<Director>,
    persistence: Arc<PersistenceGateway>,
    tasks: Arc<TaskSupervisor>,
    input: InputGate,
    voice: Arc<VoiceBank>,
    round: Mutex<RoundState>,
    tally: Mutex<Option<SessionTally>>,
    shut_down: AtomicBool,
}

impl SessionContext {
    /// Build every component and open the store.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(
        config: SessionConfig,
        port: Arc<dyn AudioPort>,
        store: Arc<dyn StorageEngine>,
        voice: VoiceBank,
    ) -> Result<Self, PersistenceError> {
        Self::open_with_telemetry(config, port, store, voice, Arc::new(TelemetryHub::default()))
            .await
    }

    pub async fn open_with_telemetry(
        config: SessionConfig,
        port: Arc<dyn AudioPort>,
        store: Arc<dyn StorageEngine>,
        voice: VoiceBank,
        telemetry: Arc<TelemetryHub>,
    ) -> Result<Self, PersistenceError> {
        let persistence = Arc::new(
            PersistenceGateway::open(
                store,
                RetryPolicy::from_config(&config.persistence),
                Arc::clone(&telemetry),
            )
            .await?,
        );
        let audio = Arc::new(AudioCoordinator::new(
            port,
            config.audio.clone(),
            Duration::from_millis(config.shutdown.audio_timeout_ms),
            Arc::clone(&telemetry),
        ));
        let director = Arc::new(Director::new(audio.clone(), Arc::clone(&telemetry)));
        let tasks = Arc::new(TaskSupervisor::new(Arc::clone(&telemetry)));

        install_tutor_watchdog(
            &director,
            &tasks,
            &telemetry,
            Duration::from_millis(config.director.tutor_timeout_ms),
        );

        let input = InputGate::from_config(&config.input);
        info!("[SessionContext] Session context ready");
        Ok(Self {
            config,
            telemetry,
            audio,
            director,
            persistence,
            tasks,
            input,
            voice: Arc::new(voice),
            round: Mutex::new(RoundState::default()),
            tally: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Arc<TelemetryHub> {
        &self.telemetry
    }

    pub fn audio(&self) -> &Arc<AudioCoordinator> {
        &self.audio
    }

    pub fn director(&self) -> &Arc<Director> {
        &self.director
    }

    pub fn persistence(&self) -> &Arc<PersistenceGateway> {
        &self.persistence
    }

    pub fn tasks(&self) -> &TaskSupervisor {
        &self.tasks
    }

    pub fn input(&self) -> &InputGate {
        &self.input
    }

    pub fn current_state(&self) -> AppState {
        self.director.current_state()
    }

    /// Level currently being played, if any.
    pub fn current_level(&self) -> Option<u32> {
        self.round().level
    }

    /// Register a transition observer for the presentation layer.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.director.subscribe(observer);
    }

    /// Single entry point for presentation events.
    pub async fn dispatch(&self, event: SessionEvent) -> Result<Dispatch, SessionError> {
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("[SessionContext] {:?} after shutdown, ignoring", event);
            return Ok(Dispatch::Rejected);
        }
        debug!("[SessionContext] Dispatching {:?}", event);
        match event {
            SessionEvent::Start => self.start().await,
            SessionEvent::LevelSelected(level) => self.select_level(level).await,
            SessionEvent::AnswerSubmitted { correct } => self.submit_answer(correct).await,
            SessionEvent::SkipRequested => Ok(applied(self.director.force_skip().await?)),
            SessionEvent::BackToMap => {
                self.director.set_state(AppState::MapBrowse).await?;
                self.round().level = None;
                Ok(Dispatch::Applied)
            }
        }
    }

    async fn start(&self) -> Result<Dispatch, SessionError> {
        self.telemetry.record_lifecycle(LifecyclePhase::SessionStarted);
        info!(
            "[SessionContext] Starting with {} eggs, next level {}",
            self.persistence.get_eggs(),
            self.persistence.next_level()
        );
        self.director.set_state(AppState::MapBrowse).await?;
        self.tally().get_or_insert_with(|| SessionTally {
            started_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            started: Instant::now(),
            attempted: 0,
            correct: 0,
        });
        self.narrate("welcome", WELCOME);
        Ok(Dispatch::Applied)
    }

    async fn select_level(&self, level: u32) -> Result<Dispatch, SessionError> {
        if !self.persistence.get_unlocked_levels().contains(&level) {
            warn!("[SessionContext] Level {} is locked", level);
            return Ok(Dispatch::Rejected);
        }
        if self.director.current_state() != AppState::MapBrowse {
            return Ok(Dispatch::Rejected);
        }

        {
            let mut round = self.round();
            round.level = Some(level);
            round.attempts = 0;
        }
        self.director.set_state(AppState::LevelLoading).await?;
        self.director.set_state(AppState::TutorSpeaking).await?;
        let narration = self.director.sequence();

        // Intro plays in the background; input opens once it settles,
        // whatever the outcome.
        let director = Arc::clone(&self.director);
        let audio = Arc::clone(&self.audio);
        let phrase = self.voice.pick(LEVEL_INTRO);
        self.tasks.launch("level-intro", async move {
            if let Some(phrase) = phrase {
                if let Err(err) = phrase.speak(&audio).await {
                    log_playback_error(&err, "level intro");
                }
            }
            director
                .transition_if(
                    |state, sequence| state == AppState::TutorSpeaking && sequence == narration,
                    AppState::InputActive,
                )
                .await?;
            Ok(())
        });
        Ok(Dispatch::Applied)
    }

    async fn submit_answer(&self, correct: bool) -> Result<Dispatch, SessionError> {
        if self.director.current_state() != AppState::InputActive {
            return Ok(Dispatch::Rejected);
        }
        if !self.input.try_submit() {
            debug!("[SessionContext] Submission while gate locked, ignoring");
            return Ok(Dispatch::Rejected);
        }
        if let Err(err) = self.director.set_state(AppState::Evaluating).await {
            self.input.reset_interaction();
            return Err(err.into());
        }
        {
            let mut tally = self.tally();
            if let Some(tally) = tally.as_mut() {
                tally.attempted += 1;
                tally.correct += u32::from(correct);
            }
        }

        if correct {
            self.reward().await
        } else {
            self.encourage().await
        }
    }

    async fn encourage(&self) -> Result<Dispatch, SessionError> {
        let attempts = {
            let mut round = self.round();
            round.attempts += 1;
            round.streak = 0;
            round.attempts
        };
        let mut lines = vec![self.voice.pick(voice_bank::wrong_category(attempts))];
        if attempts >= HINT_AFTER_ATTEMPTS {
            let hint_level = attempts + 1 - HINT_AFTER_ATTEMPTS;
            lines.push(self.voice.pick(voice_bank::hint_category(hint_level)));
        }
        for phrase in lines.into_iter().flatten() {
            match phrase.speak(&self.audio).await {
                Ok(PlaybackOutcome::Success) | Ok(PlaybackOutcome::Cancelled) => {}
                Err(err) => log_playback_error(&err, "encouragement"),
            }
        }
        let result = self.director.set_state(AppState::InputActive).await;
        self.input.reset_interaction();
        result?;
        Ok(Dispatch::Applied)
    }

    async fn reward(&self) -> Result<Dispatch, SessionError> {
        let (level, attempts, streak) = {
            let mut round = self.round();
            round.streak += 1;
            (round.level.unwrap_or(1), round.attempts, round.streak)
        };
        let rewards = &self.config.rewards;
        let stars = rewards
            .stars_per_level
            .saturating_sub(u8::try_from(attempts).unwrap_or(u8::MAX))
            .max(1);

        let credited = async {
            let eggs = self.persistence.add_eggs(u64::from(rewards.correct_answer)).await?;
            self.persistence.record_progress(level, stars).await?;
            Ok::<u64, PersistenceError>(eggs)
        }
        .await;

        let eggs = match credited {
            Ok(eggs) => eggs,
            Err(err) => {
                warn!("[SessionContext] Reward for level {} not saved", level);
                if let Err(transition) = self.director.set_state(AppState::Error).await {
                    warn!("[SessionContext] Could not enter Error state: {}", transition);
                }
                self.input.reset_interaction();
                return Err(err.into());
            }
        };
        info!(
            "[SessionContext] Level {} complete with {} star(s), {} eggs",
            level, stars, eggs
        );

        let audio = Arc::clone(&self.audio);
        self.tasks.launch("reward-effect", async move {
            if let Err(err) = audio.play_effect(REWARD_EFFECT).await {
                log_playback_error(&err, "reward effect");
            }
            Ok(())
        });

        self.director.set_state(AppState::Celebration).await?;
        self.input.reset_interaction();
        {
            let mut round = self.round();
            round.attempts = 0;
        }
        let celebration = self.director.sequence();

        let director = Arc::clone(&self.director);
        let audio = Arc::clone(&self.audio);
        let phrase = self
            .voice
            .pick(voice_bank::success_category(streak.saturating_sub(1)));
        let hold = Duration::from_millis(self.config.director.celebration_ms);
        self.tasks.launch("celebration", async move {
            if let Some(phrase) = phrase {
                if let Err(err) = phrase.speak(&audio).await {
                    log_playback_error(&err, "praise");
                }
            }
            tokio::time::sleep(hold).await;
            director
                .transition_if(
                    |state, sequence| state == AppState::Celebration && sequence == celebration,
                    AppState::MapBrowse,
                )
                .await?;
            Ok(())
        });
        Ok(Dispatch::Applied)
    }

    /// Speak a phrase from `category` on a supervised task.
    fn narrate(&self, name: &str, category: &str) {
        let Some(phrase) = self.voice.pick(category) else {
            debug!("[SessionContext] No phrase for {:?}", category);
            return;
        };
        let audio = Arc::clone(&self.audio);
        self.tasks.launch(name.to_string(), async move {
            if let Err(err) = phrase.speak(&audio).await {
                log_playback_error(&err, "narration");
            }
            Ok(())
        });
    }

    /// Say goodbye, then release everything in order: background tasks,
    /// audio, persistence. Each step is bounded by its configured timeout.
    /// Later calls return the same report without doing anything.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                abandoned_tasks: 0,
                persistence_drained: self.persistence.is_closed(),
            };
        }
        info!("[SessionContext] Shutting down");
        self.telemetry
            .record_lifecycle(LifecyclePhase::ShutdownRequested);

        let timeouts = &self.config.shutdown;
        let abandoned_tasks = self
            .tasks
            .cancel_all(Duration::from_millis(timeouts.tasks_timeout_ms))
            .await;
        self.input.cancel_timer();

        if let Some(phrase) = self.voice.pick(FAREWELL) {
            let farewell = phrase.speak(&self.audio);
            let budget = Duration::from_millis(timeouts.audio_timeout_ms);
            if tokio::time::timeout(budget, farewell).await.is_err() {
                debug!("[SessionContext] Farewell cut short");
            }
        }
        self.audio.cleanup().await;
        self.telemetry.record_lifecycle(LifecyclePhase::AudioReleased);

        let persistence_budget = Duration::from_millis(timeouts.persistence_timeout_ms);
        self.save_session(persistence_budget).await;
        let persistence_drained = self
            .persistence
            .drain(persistence_budget)
            .await;
        self.telemetry
            .record_lifecycle(LifecyclePhase::PersistenceDrained);

        info!(
            "[SessionContext] Shutdown complete ({} task(s) abandoned, persistence drained: {})",
            abandoned_tasks, persistence_drained
        );
        ShutdownReport {
            abandoned_tasks,
            persistence_drained,
        }
    }

    /// Append this session's tally to the history, bounded by `budget`.
    async fn save_session(&self, budget: Duration) {
        let Some(tally) = self.tally().take() else {
            return;
        };
        let summary = SessionSummary {
            started_at_ms: tally.started_at_ms,
            duration_ms: tally.started.elapsed().as_millis() as u64,
            attempted: tally.attempted,
            correct: tally.correct,
        };
        match tokio::time::timeout(budget, self.persistence.record_session(summary)).await {
            Ok(Ok(())) => info!(
                "[SessionContext] Session saved: {}/{} correct",
                summary.correct, summary.attempted
            ),
            Ok(Err(err)) => warn!("[SessionContext] Session history not saved: {}", err),
            Err(_) => warn!("[SessionContext] Session history save exceeded {:?}", budget),
        }
    }

    fn tally(&self) -> MutexGuard<'_, Option<SessionTally>> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn round(&self) -> MutexGuard<'_, RoundState> {
        self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn applied(accepted: bool) -> Dispatch {
    if accepted {
        Dispatch::Applied
    } else {
        Dispatch::Rejected
    }
}

/// Force InputActive if narration outlives `timeout`.
///
/// Armed on every entry into TutorSpeaking. The deadline only fires if that
/// same narration is still current, checked by transition sequence.
fn install_tutor_watchdog(
    director: &Arc<Director>,
    tasks: &Arc<TaskSupervisor>,
    telemetry: &Arc<TelemetryHub>,
    timeout: Duration,
) {
    let weak: Weak<Director> = Arc::downgrade(director);
    let tasks = Arc::clone(tasks);
    let telemetry = Arc::clone(telemetry);
    director.subscribe(move |transition| {
        if transition.to != AppState::TutorSpeaking {
            return;
        }
        let armed_at = transition.sequence;
        let director = weak.clone();
        let telemetry = Arc::clone(&telemetry);
        tasks.launch("tutor-watchdog", async move {
            tokio::time::sleep(timeout).await;
            let Some(director) = director.upgrade() else {
                return Ok(());
            };
            let fired = director
                .transition_if(
                    |state, sequence| state == AppState::TutorSpeaking && sequence == armed_at,
                    AppState::InputActive,
                )
                .await?;
            if fired {
                warn!("[SessionContext] Tutor narration exceeded {:?}, opening input", timeout);
                telemetry.record_anomaly(Anomaly::TutorTimeout, format!("after {:?}", timeout));
            }
            Ok(())
        });
    });
}
