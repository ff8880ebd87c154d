//! Capability interface between the coordinator and the audio backend.

use futures::future::BoxFuture;

use super::request::{PlaybackId, PlaybackRequest};
use crate::error::PlaybackError;

/// Trait implemented by audio output backends.
///
/// The coordinator owns all sequencing rules; a port only has to play what it
/// is given. [`SimulatedAudioPort`](super::SimulatedAudioPort) implements it
/// for tests and headless runs.
pub trait AudioPort: Send + Sync {
    /// Start playing `request` and resolve on natural completion.
    ///
    /// Playback is considered started when this method is called. Dropping
    /// the returned future abandons it; the coordinator then calls
    /// [`stop`](Self::stop) to release device resources.
    fn play(&self, request: &PlaybackRequest) -> BoxFuture<'static, Result<(), PlaybackError>>;

    /// Stop a request that was abandoned before completing.
    fn stop(&self, id: PlaybackId);

    /// Apply gain to the background music bus.
    fn set_music_gain(&self, gain: f32);

    /// Release device resources at shutdown.
    fn release(&self) -> BoxFuture<'_, ()>;
}
