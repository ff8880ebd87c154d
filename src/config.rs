//! Configuration management for session timing and retry tuning
//!
//! This module provides runtime configuration loading from JSON files, so
//! debounce windows, retry budgets and shutdown deadlines can be adjusted
//! without recompilation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Complete session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub audio: AudioConfig,
    pub persistence: PersistenceConfig,
    pub input: InputConfig,
    pub director: DirectorConfig,
    pub shutdown: ShutdownConfig,
    pub rewards: RewardConfig,
}

/// Audio coordinator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Music bus gain with nothing ducking it
    pub baseline_gain: f32,
    /// Music bus gain while the duck counter is non-zero
    pub ducked_gain: f32,
    /// Maximum simultaneous sound effects; extra requests wait their turn
    pub effect_concurrency: usize,
    /// Simulated narration speed used when no clip duration is known
    pub speech_ms_per_char: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            baseline_gain: 1.0,
            ducked_gain: 0.2,
            effect_concurrency: 4,
            speech_ms_per_char: 55,
        }
    }
}

/// Persistence gateway retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Total attempts per write, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub base_delay_ms: u64,
    /// Ceiling applied to the doubled delay
    pub max_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 25,
            max_delay_ms: 400,
        }
    }
}

impl PersistenceConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Input gate parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Cooldown after a rejected answer before taps are accepted again
    pub debounce_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

/// Director and game-flow timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    /// Force InputActive if tutor narration hangs longer than this
    pub tutor_timeout_ms: u64,
    /// How long the celebration stays up before returning to the map
    pub celebration_ms: u64,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            tutor_timeout_ms: 15_000,
            celebration_ms: 2_500,
        }
    }
}

/// Per-step shutdown deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub tasks_timeout_ms: u64,
    pub audio_timeout_ms: u64,
    pub persistence_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            tasks_timeout_ms: 1_000,
            audio_timeout_ms: 1_000,
            persistence_timeout_ms: 2_000,
        }
    }
}

/// Egg economy rewards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Eggs credited for a correct answer
    pub correct_answer: u32,
    /// Stars recorded for a completed level
    pub stars_per_level: u8,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            correct_answer: 10,
            stars_per_level: 3,
        }
    }
}

impl SessionConfig {
    /// Load configuration from JSON file
    ///
    /// Missing sections and fields fall back to their defaults. If the file
    /// doesn't exist or the JSON is invalid, the whole default config is used.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load configuration from the default location
    pub fn load() -> Self {
        Self::load_from_file("assets/session_config.json")
    }

    /// Configuration with millisecond-scale timings for tests and demos
    pub fn fast() -> Self {
        Self {
            audio: AudioConfig {
                speech_ms_per_char: 1,
                ..AudioConfig::default()
            },
            persistence: PersistenceConfig {
                max_attempts: 5,
                base_delay_ms: 1,
                max_delay_ms: 4,
            },
            input: InputConfig { debounce_ms: 30 },
            director: DirectorConfig {
                tutor_timeout_ms: 2_000,
                celebration_ms: 20,
            },
            shutdown: ShutdownConfig {
                tasks_timeout_ms: 200,
                audio_timeout_ms: 200,
                persistence_timeout_ms: 500,
            },
            rewards: RewardConfig::default(),
        }
    }
}
