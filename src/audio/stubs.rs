//! Simulated audio port for desktop testing and headless runs
//!
//! `SimulatedAudioPort` implements [`AudioPort`] without touching an output
//! device. Playback is a timer: speech lasts `chars x ms_per_char`, clips
//! last their decoded duration, effects a fixed duration. Every port call is
//! recorded so tests can assert on start order, stop calls, gain changes and
//! per-channel concurrency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use log::debug;

use super::port::AudioPort;
use super::request::{AudioSource, Channel, PlaybackId, PlaybackRequest};
use crate::error::PlaybackError;

/// Default fixed duration of a simulated sound effect
pub const DEFAULT_EFFECT_DURATION: Duration = Duration::from_millis(40);

/// One recorded call on the simulated port.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Started {
        id: PlaybackId,
        channel: Channel,
        label: String,
    },
    Finished {
        id: PlaybackId,
    },
    Stopped {
        id: PlaybackId,
    },
    Gain(f32),
    Released,
}

#[derive(Default)]
struct PortLog {
    events: Vec<PortEvent>,
    active: HashMap<Channel, usize>,
    max_active: HashMap<Channel, usize>,
    gain: Option<f32>,
}

impl PortLog {
    fn push(&mut self, event: PortEvent) {
        self.events.push(event);
    }
}

/// Decrements the channel's active count when a playback future ends or is
/// dropped.
struct ActiveGuard {
    log: Arc<Mutex<PortLog>>,
    channel: Channel,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = log.active.get_mut(&self.channel) {
            *count = count.saturating_sub(1);
        }
    }
}

pub struct SimulatedAudioPort {
    ms_per_char: u64,
    effect_duration: Duration,
    durations: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, PlaybackError>>,
    release_delay: Mutex<Duration>,
    log: Arc<Mutex<PortLog>>,
}

impl SimulatedAudioPort {
    pub fn new(ms_per_char: u64) -> Self {
        Self {
            ms_per_char,
            effect_duration: DEFAULT_EFFECT_DURATION,
            durations: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            release_delay: Mutex::new(Duration::ZERO),
            log: Arc::new(Mutex::new(PortLog::default())),
        }
    }

    pub fn with_effect_duration(mut self, duration: Duration) -> Self {
        self.effect_duration = duration;
        self
    }

    /// Override the playback duration for a label (text, clip key or effect id).
    pub fn set_duration(&self, label: &str, duration: Duration) {
        lock(&self.durations).insert(label.to_string(), duration);
    }

    /// Make the next playback of `label` fail with `err`.
    pub fn fail_next(&self, label: &str, err: PlaybackError) {
        lock(&self.failures).insert(label.to_string(), err);
    }

    /// Make `release` take `delay` to complete.
    pub fn set_release_delay(&self, delay: Duration) {
        *lock(&self.release_delay) = delay;
    }

    pub fn events(&self) -> Vec<PortEvent> {
        lock(&self.log).events.clone()
    }

    /// Labels of every request started on `channel`, in start order.
    pub fn started(&self, channel: Channel) -> Vec<String> {
        lock(&self.log)
            .events
            .iter()
            .filter_map(|event| match event {
                PortEvent::Started {
                    channel: c, label, ..
                } if *c == channel => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        lock(&self.log)
            .events
            .iter()
            .filter_map(|event| match event {
                PortEvent::Stopped { id } => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn active(&self, channel: Channel) -> usize {
        lock(&self.log).active.get(&channel).copied().unwrap_or(0)
    }

    /// Highest number of simultaneously playing requests seen on `channel`.
    pub fn max_concurrent(&self, channel: Channel) -> usize {
        lock(&self.log).max_active.get(&channel).copied().unwrap_or(0)
    }

    pub fn last_gain(&self) -> Option<f32> {
        lock(&self.log).gain
    }

    /// Number of gain changes applied to the music bus.
    pub fn gain_changes(&self) -> usize {
        lock(&self.log)
            .events
            .iter()
            .filter(|event| matches!(event, PortEvent::Gain(_)))
            .count()
    }

    pub fn is_released(&self) -> bool {
        lock(&self.log)
            .events
            .iter()
            .any(|event| matches!(event, PortEvent::Released))
    }

    fn duration_of(&self, source: &AudioSource) -> Duration {
        if let Some(duration) = lock(&self.durations).get(source.label()) {
            return *duration;
        }
        match source {
            AudioSource::Speech { text } => {
                Duration::from_millis(text.chars().count() as u64 * self.ms_per_char)
            }
            AudioSource::Clip(clip) => clip.duration,
            AudioSource::Effect { .. } => self.effect_duration,
        }
    }
}

impl AudioPort for SimulatedAudioPort {
    fn play(&self, request: &PlaybackRequest) -> BoxFuture<'static, Result<(), PlaybackError>> {
        let id = request.id;
        let channel = request.channel;
        let label = request.source.label().to_string();
        let duration = self.duration_of(&request.source);
        let failure = lock(&self.failures).remove(&label);

        {
            let mut log = lock(&self.log);
            log.push(PortEvent::Started {
                id,
                channel,
                label: label.clone(),
            });
            let count = log.active.entry(channel).or_insert(0);
            *count += 1;
            let now = *count;
            let max = log.max_active.entry(channel).or_insert(0);
            *max = (*max).max(now);
        }
        debug!("[SimulatedAudioPort] {:?} {} playing {:?} for {:?}", channel, id, label, duration);

        let guard = ActiveGuard {
            log: Arc::clone(&self.log),
            channel,
        };
        let log = Arc::clone(&self.log);
        Box::pin(async move {
            let _guard = guard;
            if let Some(err) = failure {
                return Err(err);
            }
            tokio::time::sleep(duration).await;
            lock(&log).push(PortEvent::Finished { id });
            Ok(())
        })
    }

    fn stop(&self, id: PlaybackId) {
        lock(&self.log).push(PortEvent::Stopped { id });
    }

    fn set_music_gain(&self, gain: f32) {
        let mut log = lock(&self.log);
        log.gain = Some(gain);
        log.push(PortEvent::Gain(gain));
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let delay = *lock(&self.release_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            lock(&self.log).push(PortEvent::Released);
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
