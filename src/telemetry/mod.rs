//! Session telemetry: bounded event history plus a broadcast stream.
//!
//! The collector multiplexes state transitions, playback outcomes, persistence
//! retries and background task failures into a bounded history plus an async
//! broadcast stream. The hub is constructed once per session and injected into
//! every component that reports diagnostics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::audio::Channel;
use crate::director::AppState;
use crate::error::{BackgroundTaskFailure, ErrorCode, PersistenceError};

pub mod events;

pub use events::{Anomaly, LifecyclePhase, MetricEvent, PlaybackResult};

/// Snapshot of collector state for CLI reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetrySnapshot {
    pub recent: Vec<MetricEvent>,
    pub total_events: u64,
    pub dropped_events: u64,
}

/// Broadcast-based collector retaining a bounded history of metrics.
pub struct TelemetryCollector {
    tx: broadcast::Sender<MetricEvent>,
    history: Mutex<VecDeque<MetricEvent>>,
    history_capacity: usize,
    total_events: AtomicU64,
    dropped_history: AtomicU64,
}

impl TelemetryCollector {
    pub fn new(buffer: usize, history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            total_events: AtomicU64::new(0),
            dropped_history: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: MetricEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == self.history_capacity {
                history.pop_front();
                self.dropped_history.fetch_add(1, Ordering::Relaxed);
            }
            if self.history_capacity > 0 {
                history.push_back(event.clone());
            }
        }

        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.tx.subscribe()
    }

    /// Stream of live events; lagged receivers skip what they missed.
    pub fn stream(&self) -> impl Stream<Item = MetricEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(Result::ok)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        TelemetrySnapshot {
            recent: history.iter().cloned().collect(),
            total_events: self.total_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_history.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256, 64)
    }
}

/// Top-level hub wrapping the collector with typed recording helpers.
pub struct TelemetryHub {
    collector: TelemetryCollector,
}

impl TelemetryHub {
    pub fn new(channel_capacity: usize, history_capacity: usize) -> Self {
        Self {
            collector: TelemetryCollector::new(channel_capacity, history_capacity),
        }
    }

    pub fn collector(&self) -> &TelemetryCollector {
        &self.collector
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.collector.snapshot()
    }

    pub fn record_transition(&self, from: AppState, to: AppState) {
        self.collector
            .publish(MetricEvent::StateTransition { from, to });
    }

    pub fn record_playback(&self, channel: Channel, request_id: u64, result: PlaybackResult) {
        self.collector.publish(MetricEvent::Playback {
            channel,
            request_id,
            result,
        });
    }

    pub fn record_ducking(&self, level: u32) {
        self.collector.publish(MetricEvent::Ducking {
            level,
            ducked: level > 0,
        });
    }

    pub fn record_retry(&self, attempt: u32, delay_ms: u64) {
        self.collector
            .publish(MetricEvent::PersistenceRetry { attempt, delay_ms });
    }

    pub fn record_persistence_failure(&self, err: &PersistenceError) {
        self.collector.publish(MetricEvent::PersistenceFailure {
            code: err.code(),
            message: err.message(),
        });
    }

    pub fn record_task_failure(&self, failure: &BackgroundTaskFailure) {
        self.collector.publish(MetricEvent::BackgroundTaskFailure {
            task: failure.task().to_string(),
            code: failure.code(),
            message: failure.message(),
        });
    }

    pub fn record_lifecycle(&self, phase: LifecyclePhase) {
        self.collector.publish(MetricEvent::Lifecycle {
            phase,
            timestamp_ms: now_timestamp_ms(),
        });
    }

    pub fn record_anomaly(&self, code: Anomaly, context: impl Into<String>) {
        self.collector.publish(MetricEvent::Anomaly {
            code,
            context: context.into(),
        });
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(256, 128)
    }
}

fn now_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_preserves_order_within_history() {
        let collector = TelemetryCollector::new(8, 3);
        collector.publish(MetricEvent::StateTransition {
            from: AppState::Idle,
            to: AppState::MapBrowse,
        });
        collector.publish(MetricEvent::Ducking {
            level: 1,
            ducked: true,
        });
        collector.publish(MetricEvent::PersistenceRetry {
            attempt: 1,
            delay_ms: 25,
        });

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.recent.len(), 3);
        assert!(matches!(
            snapshot.recent[0],
            MetricEvent::StateTransition {
                to: AppState::MapBrowse,
                ..
            }
        ));
        assert!(matches!(
            snapshot.recent[2],
            MetricEvent::PersistenceRetry { attempt: 1, .. }
        ));
    }

    #[test]
    fn collector_drops_history_when_full() {
        let collector = TelemetryCollector::new(8, 2);
        for level in 1..=3 {
            collector.publish(MetricEvent::Ducking {
                level,
                ducked: true,
            });
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.recent.len(), 2);
        assert_eq!(snapshot.dropped_events, 1);
        assert_eq!(snapshot.total_events, 3);
        assert!(matches!(
            snapshot.recent[0],
            MetricEvent::Ducking { level: 2, .. }
        ));
    }

    #[test]
    fn hub_records_task_failure_with_code() {
        let hub = TelemetryHub::new(8, 8);
        hub.record_task_failure(&BackgroundTaskFailure::Failed {
            task: "intro".to_string(),
            reason: "boom".to_string(),
        });

        let snapshot = hub.snapshot();
        assert!(snapshot.recent.iter().any(|event| matches!(
            event,
            MetricEvent::BackgroundTaskFailure { code: 5001, task, .. } if task == "intro"
        )));
    }

    #[test]
    fn metric_event_serializes_with_tag() {
        let json = serde_json::to_string(&MetricEvent::Ducking {
            level: 0,
            ducked: false,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"ducking\""));
    }

    #[tokio::test]
    async fn subscribers_receive_live_events() {
        let hub = TelemetryHub::new(8, 8);
        let mut rx = hub.collector().subscribe();
        hub.record_lifecycle(LifecyclePhase::SessionStarted);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            MetricEvent::Lifecycle {
                phase: LifecyclePhase::SessionStarted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stream_yields_events_in_order() {
        let hub = TelemetryHub::new(8, 8);
        let stream = hub.collector().stream();
        tokio::pin!(stream);
        hub.record_ducking(1);
        hub.record_ducking(0);

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(matches!(first, MetricEvent::Ducking { level: 1, ducked: true }));
        assert!(matches!(second, MetricEvent::Ducking { level: 0, ducked: false }));
    }
}
