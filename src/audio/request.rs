// Playback request types and the cooperative cancellation token

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Logical playback lane with its own concurrency and interruption rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Foreground narration; at most one active request
    Speech,
    /// Sound effects; bounded concurrency
    Effect,
}

/// How a playback request ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to natural completion
    Success,
    /// Interrupted by a newer speech request or by cleanup
    Cancelled,
}

/// Unique identifier of one playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A pre-recorded clip resolved by the voice clip lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRef {
    pub key: String,
    pub path: PathBuf,
    pub duration: Duration,
}

/// What a request plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Text handed to the port's speech backend
    Speech { text: String },
    /// Pre-recorded voice clip
    Clip(ClipRef),
    /// Named sound effect
    Effect { id: String },
}

impl AudioSource {
    /// Short human-readable label used in logs and by test doubles.
    pub fn label(&self) -> &str {
        match self {
            AudioSource::Speech { text } => text,
            AudioSource::Clip(clip) => &clip.key,
            AudioSource::Effect { id } => id,
        }
    }
}

/// Cooperative cancellation flag shared between a request and its owner.
///
/// Cloning yields a handle to the same flag. Once cancelled it stays
/// cancelled.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One `speak`/`play_effect` call in flight.
#[derive(Debug, Clone)]
pub struct PlaybackRequest {
    pub id: PlaybackId,
    pub source: AudioSource,
    pub channel: Channel,
    pub token: CancelToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        waiter.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(
            AudioSource::Effect {
                id: "correct".to_string()
            }
            .label(),
            "correct"
        );
        assert_eq!(
            AudioSource::Speech {
                text: "Great job!".to_string()
            }
            .label(),
            "Great job!"
        );
    }
}
