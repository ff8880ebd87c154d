// Error types for the session orchestration layer
//
// This module defines custom error types for state transitions, playback,
// persistence and background tasks, providing structured error handling with
// numeric codes suitable for surfacing to the presentation layer.

mod persistence;
mod playback;
mod session;
mod task;
mod transition;

pub use persistence::{log_persistence_error, PersistenceError, PersistenceErrorCodes};
pub use playback::{log_playback_error, PlaybackError, PlaybackErrorCodes};
pub use session::SessionError;
pub use task::{log_task_failure, BackgroundTaskFailure, TaskErrorCodes};
pub use transition::{log_transition_error, InvalidTransition, TransitionErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// component boundaries.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
