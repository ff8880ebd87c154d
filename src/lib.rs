// Omni Session Core - tutoring session orchestration
// State machine, audio channel coordination and crash-safe progress storage

// Module declarations
pub mod audio;
pub mod config;
pub mod context;
pub mod director;
pub mod error;
pub mod input;
pub mod persistence;
pub mod tasks;
pub mod telemetry;

// Re-exports for convenience
pub use audio::{AudioCoordinator, AudioPort, PlaybackOutcome, SimulatedAudioPort, VoiceBank};
pub use config::SessionConfig;
pub use context::{Dispatch, SessionContext, SessionEvent, ShutdownReport};
pub use director::{AppState, Director, StateTransition, TransitionTable};
pub use error::{
    BackgroundTaskFailure, ErrorCode, InvalidTransition, PersistenceError, PlaybackError,
    SessionError,
};
pub use input::InputGate;
pub use persistence::{
    JsonFileStore, MemoryStore, PersistenceGateway, ProgressRecord, StorageEngine,
};
pub use tasks::TaskSupervisor;
pub use telemetry::{MetricEvent, TelemetryHub};
