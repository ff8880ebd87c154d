// Session-level error wrapping the failures a dispatched event can surface

use crate::error::{ErrorCode, InvalidTransition, PersistenceError};
use std::fmt;

/// Failure returned from `SessionContext::dispatch`
///
/// Codes are those of the wrapped error, so the presentation layer can
/// branch on the same ranges it already knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Transition(InvalidTransition),
    Persistence(PersistenceError),
}

impl SessionError {
    /// Whether the presentation layer should offer a retry action
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Transition(_) => false,
            SessionError::Persistence(err) => !err.is_permanent(),
        }
    }
}

impl ErrorCode for SessionError {
    fn code(&self) -> i32 {
        match self {
            SessionError::Transition(err) => err.code(),
            SessionError::Persistence(err) => err.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            SessionError::Transition(err) => err.message(),
            SessionError::Persistence(err) => err.message(),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transition(err) => write!(f, "{}", err),
            SessionError::Persistence(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transition(err) => Some(err),
            SessionError::Persistence(err) => Some(err),
        }
    }
}

impl From<InvalidTransition> for SessionError {
    fn from(err: InvalidTransition) -> Self {
        SessionError::Transition(err)
    }
}

impl From<PersistenceError> for SessionError {
    fn from(err: PersistenceError) -> Self {
        SessionError::Persistence(err)
    }
}
