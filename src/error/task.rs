// Background task failure types

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Task failure code constants
///
/// Error code range: 5001-5009
pub struct TaskErrorCodes {}

impl TaskErrorCodes {
    /// Operation returned an error
    pub const FAILED: i32 = 5001;

    /// Operation panicked
    pub const PANICKED: i32 = 5002;

    /// Operation ignored cooperative cancellation past the shutdown deadline
    pub const ABANDONED: i32 = 5003;
}

/// Log a background task failure
pub fn log_task_failure(err: &BackgroundTaskFailure, context: &str) {
    error!(
        "Background task failure in {}: code={}, component=TaskSupervisor, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Failure captured by the task supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundTaskFailure {
    Failed { task: String, reason: String },
    Panicked { task: String, reason: String },
    Abandoned { task: String },
}

impl BackgroundTaskFailure {
    pub fn task(&self) -> &str {
        match self {
            BackgroundTaskFailure::Failed { task, .. }
            | BackgroundTaskFailure::Panicked { task, .. }
            | BackgroundTaskFailure::Abandoned { task } => task,
        }
    }
}

impl ErrorCode for BackgroundTaskFailure {
    fn code(&self) -> i32 {
        match self {
            BackgroundTaskFailure::Failed { .. } => TaskErrorCodes::FAILED,
            BackgroundTaskFailure::Panicked { .. } => TaskErrorCodes::PANICKED,
            BackgroundTaskFailure::Abandoned { .. } => TaskErrorCodes::ABANDONED,
        }
    }

    fn message(&self) -> String {
        match self {
            BackgroundTaskFailure::Failed { task, reason } => {
                format!("Task '{}' failed: {}", task, reason)
            }
            BackgroundTaskFailure::Panicked { task, reason } => {
                format!("Task '{}' panicked: {}", task, reason)
            }
            BackgroundTaskFailure::Abandoned { task } => {
                format!("Task '{}' did not settle before the shutdown deadline", task)
            }
        }
    }
}

impl fmt::Display for BackgroundTaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackgroundTaskFailure (code {}): {}",
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for BackgroundTaskFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_name_accessor() {
        let failure = BackgroundTaskFailure::Abandoned {
            task: "intro".to_string(),
        };
        assert_eq!(failure.task(), "intro");
        assert_eq!(failure.code(), TaskErrorCodes::ABANDONED);
    }
}
