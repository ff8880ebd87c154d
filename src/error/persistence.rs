// Persistence error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Persistence error code constants
///
/// Error code range: 4001-4009
pub struct PersistenceErrorCodes {}

impl PersistenceErrorCodes {
    /// Store stayed busy/locked for every retry attempt
    pub const UNAVAILABLE: i32 = 4001;

    /// Stored data is corrupt
    pub const CORRUPT: i32 = 4002;

    /// Store access was denied by the OS
    pub const DENIED: i32 = 4003;

    /// Gateway has been drained at shutdown
    pub const CLOSED: i32 = 4004;
}

/// Log a persistence error with structured context
pub fn log_persistence_error(err: &PersistenceError, context: &str) {
    error!(
        "Persistence error in {}: code={}, component=PersistenceGateway, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Errors surfaced by the persistence gateway
///
/// Every variant guarantees the stored value is unchanged by the failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Transient contention outlasted the retry budget
    Unavailable { attempts: u32 },

    /// Stored data is corrupt; never retried
    Corrupt { details: String },

    /// Permission denied; never retried
    Denied { details: String },

    /// Gateway no longer accepts writes
    Closed,
}

impl PersistenceError {
    /// Whether the failure is permanent and should not be offered as a retry
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PersistenceError::Corrupt { .. } | PersistenceError::Denied { .. }
        )
    }
}

impl ErrorCode for PersistenceError {
    fn code(&self) -> i32 {
        match self {
            PersistenceError::Unavailable { .. } => PersistenceErrorCodes::UNAVAILABLE,
            PersistenceError::Corrupt { .. } => PersistenceErrorCodes::CORRUPT,
            PersistenceError::Denied { .. } => PersistenceErrorCodes::DENIED,
            PersistenceError::Closed => PersistenceErrorCodes::CLOSED,
        }
    }

    fn message(&self) -> String {
        match self {
            PersistenceError::Unavailable { attempts } => {
                format!("Store busy after {} attempts; nothing was written", attempts)
            }
            PersistenceError::Corrupt { details } => format!("Store is corrupt: {}", details),
            PersistenceError::Denied { details } => format!("Store access denied: {}", details),
            PersistenceError::Closed => "Persistence gateway is closed".to_string(),
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PersistenceError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for PersistenceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(!PersistenceError::Unavailable { attempts: 5 }.is_permanent());
        assert!(PersistenceError::Corrupt {
            details: "x".to_string()
        }
        .is_permanent());
        assert!(PersistenceError::Denied {
            details: "x".to_string()
        }
        .is_permanent());
        assert!(!PersistenceError::Closed.is_permanent());
    }

    #[test]
    fn test_unavailable_message_reports_attempts() {
        let err = PersistenceError::Unavailable { attempts: 3 };
        assert_eq!(err.code(), PersistenceErrorCodes::UNAVAILABLE);
        assert!(err.message().contains("3 attempts"));
    }
}
