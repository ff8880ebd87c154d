//! Core telemetry event types describing diagnostics data exposed to the
//! CLI and to presentation-layer subscribers.

use serde::{Deserialize, Serialize};

use crate::audio::Channel;
use crate::director::AppState;

/// High-level session lifecycle stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    SessionStarted,
    ShutdownRequested,
    TasksCancelled,
    AudioReleased,
    PersistenceDrained,
}

/// How a playback request ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackResult {
    Success,
    Cancelled,
    Failed,
}

/// Diagnostic anomaly codes surfaced via telemetry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// `duck(false)` with the counter already at zero
    UnbalancedUnduck,
    /// Tutor narration outlived its watchdog
    TutorTimeout,
    /// Component cleanup exceeded its shutdown budget
    ShutdownTimeout,
}

/// Metric events covering transitions, playback, persistence and task health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MetricEvent {
    StateTransition {
        from: AppState,
        to: AppState,
    },
    Playback {
        channel: Channel,
        request_id: u64,
        result: PlaybackResult,
    },
    Ducking {
        level: u32,
        ducked: bool,
    },
    PersistenceRetry {
        attempt: u32,
        delay_ms: u64,
    },
    PersistenceFailure {
        code: i32,
        message: String,
    },
    BackgroundTaskFailure {
        task: String,
        code: i32,
        message: String,
    },
    Lifecycle {
        phase: LifecyclePhase,
        timestamp_ms: u64,
    },
    Anomaly {
        code: Anomaly,
        context: String,
    },
}
