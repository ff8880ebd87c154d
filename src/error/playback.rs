// Playback error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Playback error code constants
///
/// Error code range: 3001-3009
pub struct PlaybackErrorCodes {}

impl PlaybackErrorCodes {
    /// Audio source could not be found
    pub const MISSING_SOURCE: i32 = 3001;

    /// Audio source exists but could not be decoded
    pub const DECODE_ERROR: i32 = 3002;

    /// Output device failed during playback
    pub const DEVICE_ERROR: i32 = 3003;

    /// Playback channel has been shut down
    pub const CHANNEL_CLOSED: i32 = 3004;
}

/// Log a playback error with structured context
///
/// Playback errors are never fatal; callers fall back to silent
/// continuation. The log line is still emitted at `error` so dropped
/// narration is visible in diagnostics.
pub fn log_playback_error(err: &PlaybackError, context: &str) {
    error!(
        "Playback error in {}: code={}, component=AudioCoordinator, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Device or media failure during playback
///
/// Cancellation is not an error: it is reported as
/// [`PlaybackOutcome::Cancelled`](crate::audio::PlaybackOutcome).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Audio source could not be found
    MissingSource { key: String },

    /// Audio source exists but could not be decoded
    Decode { reason: String },

    /// Output device failed during playback
    Device { reason: String },

    /// Playback channel has been shut down
    ChannelClosed,
}

impl ErrorCode for PlaybackError {
    fn code(&self) -> i32 {
        match self {
            PlaybackError::MissingSource { .. } => PlaybackErrorCodes::MISSING_SOURCE,
            PlaybackError::Decode { .. } => PlaybackErrorCodes::DECODE_ERROR,
            PlaybackError::Device { .. } => PlaybackErrorCodes::DEVICE_ERROR,
            PlaybackError::ChannelClosed => PlaybackErrorCodes::CHANNEL_CLOSED,
        }
    }

    fn message(&self) -> String {
        match self {
            PlaybackError::MissingSource { key } => format!("Audio source not found: {}", key),
            PlaybackError::Decode { reason } => format!("Failed to decode audio: {}", reason),
            PlaybackError::Device { reason } => format!("Audio device error: {}", reason),
            PlaybackError::ChannelClosed => {
                "Playback channel closed. The coordinator has been cleaned up.".to_string()
            }
        }
    }
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PlaybackError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for PlaybackError {}

impl From<hound::Error> for PlaybackError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
                PlaybackError::MissingSource {
                    key: io.to_string(),
                }
            }
            other => PlaybackError::Decode {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_error_codes() {
        assert_eq!(
            PlaybackError::MissingSource {
                key: "welcome".to_string()
            }
            .code(),
            PlaybackErrorCodes::MISSING_SOURCE
        );
        assert_eq!(
            PlaybackError::Decode {
                reason: "bad header".to_string()
            }
            .code(),
            PlaybackErrorCodes::DECODE_ERROR
        );
        assert_eq!(
            PlaybackError::Device {
                reason: "unplugged".to_string()
            }
            .code(),
            PlaybackErrorCodes::DEVICE_ERROR
        );
        assert_eq!(
            PlaybackError::ChannelClosed.code(),
            PlaybackErrorCodes::CHANNEL_CLOSED
        );
    }

    #[test]
    fn test_hound_format_error_maps_to_decode() {
        let err: PlaybackError = hound::Error::FormatError("no RIFF tag").into();
        assert!(matches!(err, PlaybackError::Decode { .. }));
    }

    #[test]
    fn test_hound_not_found_maps_to_missing_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone.wav");
        let err: PlaybackError = hound::Error::IoError(io).into();
        assert!(matches!(err, PlaybackError::MissingSource { .. }));
    }
}
