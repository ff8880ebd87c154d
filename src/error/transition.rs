// State transition error types and constants

use crate::director::AppState;
use crate::error::ErrorCode;
use log::warn;
use std::fmt;

/// Transition error code constants
///
/// Error code range: 2001-2009
pub struct TransitionErrorCodes {}

impl TransitionErrorCodes {
    /// The (from, to) pair is absent from the transition table
    pub const INVALID_TRANSITION: i32 = 2001;
}

/// Log a rejected transition with structured context
///
/// Rejections are non-fatal (state is left unchanged), so they are logged
/// at `warn` rather than `error`.
pub fn log_transition_error(err: &InvalidTransition, context: &str) {
    warn!(
        "Transition rejected in {}: code={}, component=Director, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// A state change that is not present in the transition table
///
/// The Director's state is guaranteed unchanged when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: AppState,
    pub to: AppState,
}

impl ErrorCode for InvalidTransition {
    fn code(&self) -> i32 {
        TransitionErrorCodes::INVALID_TRANSITION
    }

    fn message(&self) -> String {
        format!("Transition {:?} -> {:?} is not allowed", self.from, self.to)
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidTransition (code {}): {}",
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message_names_both_states() {
        let err = InvalidTransition {
            from: AppState::Idle,
            to: AppState::Celebration,
        };
        assert_eq!(err.code(), 2001);
        assert!(err.message().contains("Idle"));
        assert!(err.message().contains("Celebration"));
        assert!(err.to_string().contains("2001"));
    }
}
