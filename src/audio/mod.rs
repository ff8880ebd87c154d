// Audio module - speech/effect channel coordination and music ducking

pub mod coordinator;
pub mod ducking;
pub mod port;
pub mod request;
pub mod stubs;
pub mod voice_bank;

// Re-export commonly used types for convenience
pub use coordinator::AudioCoordinator;
pub use ducking::{DuckChange, DuckCounter};
pub use port::AudioPort;
pub use request::{
    AudioSource, CancelToken, Channel, ClipRef, PlaybackId, PlaybackOutcome, PlaybackRequest,
};
pub use stubs::{PortEvent, SimulatedAudioPort};
pub use voice_bank::{Phrase, VoiceBank, VoiceLine};
