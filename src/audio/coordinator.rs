//! AudioCoordinator: speech exclusivity, bounded effects and ducking.
//!
//! The speech channel is an actor task. Every `speak` call is a command on
//! its queue; when a new request arrives while one is playing, the worker
//! cancels the current playback, resolves its caller with
//! [`PlaybackOutcome::Cancelled`], and only then asks the port to start the
//! new one. Effects run directly on the caller's task behind a fair
//! semaphore, so requests beyond the cap wait in arrival order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, OnceCell, Semaphore};

use super::ducking::{DuckChange, DuckCounter};
use super::port::AudioPort;
use super::request::{
    AudioSource, CancelToken, Channel, ClipRef, PlaybackId, PlaybackOutcome, PlaybackRequest,
};
use crate::config::AudioConfig;
use crate::director::{AppState, TransitionEffect, TransitionHooks};
use crate::error::{log_playback_error, PlaybackError};
use crate::telemetry::{Anomaly, PlaybackResult, TelemetryHub};

type Responder = oneshot::Sender<Result<PlaybackOutcome, PlaybackError>>;

enum SpeechCommand {
    Speak {
        request: PlaybackRequest,
        respond: Responder,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

struct ActiveSpeech {
    request: PlaybackRequest,
    respond: Responder,
    playback: BoxFuture<'static, Result<(), PlaybackError>>,
}

enum Wake {
    Finished(Result<(), PlaybackError>),
    Command(Option<SpeechCommand>),
    Abandoned,
}

/// Owns the speech channel's single active request.
struct SpeechWorker {
    port: Arc<dyn AudioPort>,
    telemetry: Arc<TelemetryHub>,
    speaking: Arc<AtomicBool>,
    active: Option<ActiveSpeech>,
}

impl SpeechWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SpeechCommand>) {
        loop {
            let wake = match self.active.as_mut() {
                None => Wake::Command(rx.recv().await),
                Some(current) => tokio::select! {
                    biased;
                    result = &mut current.playback => Wake::Finished(result),
                    command = rx.recv() => Wake::Command(command),
                    _ = current.respond.closed() => Wake::Abandoned,
                },
            };

            match wake {
                Wake::Finished(result) => self.finish(result),
                Wake::Abandoned => self.cancel_active("caller went away"),
                Wake::Command(Some(SpeechCommand::Speak { request, respond })) => {
                    self.cancel_active("superseded");
                    self.start(request, respond);
                }
                Wake::Command(Some(SpeechCommand::Shutdown { ack })) => {
                    self.cancel_active("cleanup");
                    rx.close();
                    while let Ok(command) = rx.try_recv() {
                        Self::reject(command);
                    }
                    let _ = ack.send(());
                    break;
                }
                Wake::Command(None) => {
                    self.cancel_active("coordinator dropped");
                    break;
                }
            }
        }
        self.speaking.store(false, Ordering::SeqCst);
        debug!("[AudioCoordinator] Speech worker stopped");
    }

    fn start(&mut self, request: PlaybackRequest, respond: Responder) {
        debug!(
            "[AudioCoordinator] Speech {} started: {:?}",
            request.id,
            request.source.label()
        );
        let playback = self.port.play(&request);
        self.speaking.store(true, Ordering::SeqCst);
        self.active = Some(ActiveSpeech {
            request,
            respond,
            playback,
        });
    }

    fn finish(&mut self, result: Result<(), PlaybackError>) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.speaking.store(false, Ordering::SeqCst);
        let id = active.request.id;
        let outcome = match result {
            Ok(()) => {
                debug!("[AudioCoordinator] Speech {} completed", id);
                self.telemetry
                    .record_playback(Channel::Speech, id.0, PlaybackResult::Success);
                Ok(PlaybackOutcome::Success)
            }
            Err(err) => {
                log_playback_error(&err, "speak");
                self.telemetry
                    .record_playback(Channel::Speech, id.0, PlaybackResult::Failed);
                Err(err)
            }
        };
        let _ = active.respond.send(outcome);
    }

    fn cancel_active(&mut self, reason: &str) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.speaking.store(false, Ordering::SeqCst);
        let id = active.request.id;
        active.request.token.cancel();
        drop(active.playback);
        self.port.stop(id);
        debug!("[AudioCoordinator] Speech {} cancelled ({})", id, reason);
        self.telemetry
            .record_playback(Channel::Speech, id.0, PlaybackResult::Cancelled);
        let _ = active.respond.send(Ok(PlaybackOutcome::Cancelled));
    }

    fn reject(command: SpeechCommand) {
        match command {
            SpeechCommand::Speak { respond, .. } => {
                let _ = respond.send(Ok(PlaybackOutcome::Cancelled));
            }
            SpeechCommand::Shutdown { ack } => {
                let _ = ack.send(());
            }
        }
    }
}

pub struct AudioCoordinator {
    port: Arc<dyn AudioPort>,
    config: AudioConfig,
    telemetry: Arc<TelemetryHub>,
    ducking: Mutex<DuckCounter>,
    next_id: AtomicU64,
    speech_tx: mpsc::UnboundedSender<SpeechCommand>,
    speaking: Arc<AtomicBool>,
    effects: Semaphore,
    effects_token: CancelToken,
    cleanup_timeout: Duration,
    cleaned_up: OnceCell<()>,
}

impl AudioCoordinator {
    /// Create the coordinator and spawn its speech worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        port: Arc<dyn AudioPort>,
        config: AudioConfig,
        cleanup_timeout: Duration,
        telemetry: Arc<TelemetryHub>,
    ) -> Self {
        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let speaking = Arc::new(AtomicBool::new(false));
        let worker = SpeechWorker {
            port: Arc::clone(&port),
            telemetry: Arc::clone(&telemetry),
            speaking: Arc::clone(&speaking),
            active: None,
        };
        tokio::spawn(worker.run(speech_rx));

        port.set_music_gain(config.baseline_gain);
        let effects = Semaphore::new(config.effect_concurrency.max(1));

        Self {
            port,
            config,
            telemetry,
            ducking: Mutex::new(DuckCounter::new()),
            next_id: AtomicU64::new(1),
            speech_tx,
            speaking,
            effects,
            effects_token: CancelToken::new(),
            cleanup_timeout,
            cleaned_up: OnceCell::new(),
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn duck_level(&self) -> u32 {
        self.ducking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .level()
    }

    /// Add (`true`) or release (`false`) one reason for ducked music.
    ///
    /// Gain changes only on the 0 -> 1 and 1 -> 0 edges. A release with
    /// nothing ducked is ignored and reported as an anomaly.
    pub fn duck(&self, active: bool) {
        let mut counter = self
            .ducking
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match counter.apply(active) {
            DuckChange::Engaged => self.port.set_music_gain(self.config.ducked_gain),
            DuckChange::Released => self.port.set_music_gain(self.config.baseline_gain),
            DuckChange::Held => {}
            DuckChange::Unbalanced => {
                warn!("[AudioCoordinator] duck(false) with nothing ducked, ignoring");
                self.telemetry
                    .record_anomaly(Anomaly::UnbalancedUnduck, "duck(false) at level 0");
            }
        }
        self.telemetry.record_ducking(counter.level());
    }

    /// Speak `text` on the speech channel, interrupting any narration in flight.
    ///
    /// Resolves `Success` on natural completion, `Cancelled` if a newer
    /// request or cleanup interrupts it. Empty text resolves immediately
    /// without touching the channel.
    pub async fn speak(&self, text: &str) -> Result<PlaybackOutcome, PlaybackError> {
        if text.trim().is_empty() {
            return Ok(PlaybackOutcome::Success);
        }
        self.speak_source(AudioSource::Speech {
            text: text.to_string(),
        })
        .await
    }

    /// Play a pre-recorded voice clip on the speech channel.
    pub async fn speak_clip(&self, clip: ClipRef) -> Result<PlaybackOutcome, PlaybackError> {
        self.speak_source(AudioSource::Clip(clip)).await
    }

    async fn speak_source(&self, source: AudioSource) -> Result<PlaybackOutcome, PlaybackError> {
        let request = PlaybackRequest {
            id: self.next_request_id(),
            source,
            channel: Channel::Speech,
            token: CancelToken::new(),
        };
        let (respond, outcome) = oneshot::channel();
        self.speech_tx
            .send(SpeechCommand::Speak { request, respond })
            .map_err(|_| PlaybackError::ChannelClosed)?;
        outcome.await.unwrap_or(Err(PlaybackError::ChannelClosed))
    }

    /// Play a sound effect. Up to `effect_concurrency` play at once; the rest
    /// wait in arrival order.
    pub async fn play_effect(&self, id: &str) -> Result<PlaybackOutcome, PlaybackError> {
        if self.effects_token.is_cancelled() {
            return Err(PlaybackError::ChannelClosed);
        }
        let request = PlaybackRequest {
            id: self.next_request_id(),
            source: AudioSource::Effect { id: id.to_string() },
            channel: Channel::Effect,
            token: self.effects_token.clone(),
        };

        let Ok(_permit) = self.effects.acquire().await else {
            self.telemetry
                .record_playback(Channel::Effect, request.id.0, PlaybackResult::Cancelled);
            return Ok(PlaybackOutcome::Cancelled);
        };

        let result = tokio::select! {
            biased;
            _ = request.token.cancelled() => {
                self.port.stop(request.id);
                Ok(PlaybackOutcome::Cancelled)
            }
            result = self.port.play(&request) => result.map(|()| PlaybackOutcome::Success),
        };

        let recorded = match &result {
            Ok(PlaybackOutcome::Success) => PlaybackResult::Success,
            Ok(PlaybackOutcome::Cancelled) => PlaybackResult::Cancelled,
            Err(err) => {
                log_playback_error(err, "play_effect");
                PlaybackResult::Failed
            }
        };
        self.telemetry
            .record_playback(Channel::Effect, request.id.0, recorded);
        result
    }

    /// Release playback resources.
    ///
    /// Cancels in-flight speech and effects first. The release work runs on
    /// its own task, so it completes even if the caller stops waiting; the
    /// wait itself is bounded by the cleanup timeout. Repeated calls share
    /// the first call's result.
    pub async fn cleanup(&self) {
        self.cleaned_up.get_or_init(|| self.release_all()).await;
    }

    async fn release_all(&self) {
        info!("[AudioCoordinator] Cleaning up playback resources");
        self.effects_token.cancel();
        self.effects.close();

        let speech_tx = self.speech_tx.clone();
        let port = Arc::clone(&self.port);
        let work = tokio::spawn(async move {
            let (ack, done) = oneshot::channel();
            if speech_tx.send(SpeechCommand::Shutdown { ack }).is_ok() {
                let _ = done.await;
            }
            port.release().await;
        });

        match tokio::time::timeout(self.cleanup_timeout, work).await {
            Ok(Ok(())) => info!("[AudioCoordinator] Playback resources released"),
            Ok(Err(err)) => error!("[AudioCoordinator] Cleanup task failed: {}", err),
            Err(_) => {
                warn!(
                    "[AudioCoordinator] Cleanup exceeded {:?}, continuing shutdown",
                    self.cleanup_timeout
                );
                self.telemetry
                    .record_anomaly(Anomaly::ShutdownTimeout, "audio cleanup");
            }
        }
    }

    fn next_request_id(&self) -> PlaybackId {
        PlaybackId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Director entry/exit actions: hold one duck while in a ducking state.
impl TransitionHooks for AudioCoordinator {
    fn on_exit(&self, _from: AppState, effect: TransitionEffect) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if effect.restore_on_exit {
                self.duck(false);
            }
        })
    }

    fn on_entry(&self, _to: AppState, effect: TransitionEffect) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if effect.duck_on_entry {
                self.duck(true);
            }
        })
    }
}
