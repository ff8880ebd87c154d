// VoiceBank - tutor phrase catalog and pre-recorded clip lookup
//
// Phrases are grouped by category ("welcome", "success_high", ...). A phrase
// has its text and, when a recording exists on disk, a clip whose duration is
// read from the WAV header. Phrases without a recording are spoken as text.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use rand::seq::SliceRandom;

use super::coordinator::AudioCoordinator;
use super::request::{ClipRef, PlaybackOutcome};
use crate::error::PlaybackError;

pub const WELCOME: &str = "welcome";
pub const LEVEL_INTRO: &str = "level_intro";
pub const FAREWELL: &str = "farewell";

/// One catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceLine {
    pub text: String,
    pub clip: Option<ClipRef>,
}

/// What the tutor says: a recording if one exists, otherwise the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phrase {
    Clip(ClipRef),
    Text(String),
}

impl Phrase {
    pub async fn speak(&self, audio: &AudioCoordinator) -> Result<PlaybackOutcome, PlaybackError> {
        match self {
            Phrase::Clip(clip) => audio.speak_clip(clip.clone()).await,
            Phrase::Text(text) => audio.speak(text).await,
        }
    }
}

impl From<&VoiceLine> for Phrase {
    fn from(line: &VoiceLine) -> Self {
        match &line.clip {
            Some(clip) => Phrase::Clip(clip.clone()),
            None => Phrase::Text(line.text.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VoiceBank {
    lines: BTreeMap<String, Vec<VoiceLine>>,
}

impl VoiceBank {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Text-only bank with the default tutor lines.
    pub fn builtin() -> Self {
        let catalog: &[(&str, &[&str])] = &[
            (WELCOME, &["Welcome back! Pick a level on the map."]),
            (LEVEL_INTRO, &["Let's count together!", "Ready? Here we go!"]),
            ("success_basic", &["Great job!", "That's right!"]),
            ("success_medium", &["Well done!", "You got it!"]),
            ("success_high", &["Fantastic work!", "Amazing!"]),
            ("success_personalized", &["You're getting so good at this!"]),
            ("success_streak", &["Wow, you're on a roll!"]),
            ("wrong_gentle", &["Let's try again!", "Almost! Try once more."]),
            ("wrong_encouraging", &["Keep going, you can do it!"]),
            ("wrong_supportive", &["That's okay. Let's do it together."]),
            ("hints_basic", &["Try counting one at a time."]),
            ("hints_advanced", &["Point to each one as you count."]),
            ("hints_together", &["Let's count them together."]),
            (FAREWELL, &["See you next time!"]),
        ];

        catalog
            .iter()
            .fold(Self::empty(), |bank, (category, texts)| bank.with_text(category, texts))
    }

    /// Add text-only lines to `category`.
    pub fn with_text(mut self, category: &str, texts: &[&str]) -> Self {
        self.lines
            .entry(category.to_string())
            .or_default()
            .extend(texts.iter().map(|text| VoiceLine {
                text: text.to_string(),
                clip: None,
            }));
        self
    }

    /// Load a JSON catalog (`{"category": ["text", ...]}`) and attach the
    /// recordings found in `clip_dir`.
    ///
    /// Recordings are named by [`clip_file_name`]. Missing or unreadable
    /// recordings leave the line as text-only.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(catalog: P, clip_dir: Q) -> Result<Self, PlaybackError> {
        let catalog = catalog.as_ref();
        let contents = fs::read_to_string(catalog).map_err(|_| PlaybackError::MissingSource {
            key: catalog.display().to_string(),
        })?;
        let raw: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&contents).map_err(|e| PlaybackError::Decode {
                reason: format!("voice catalog {}: {}", catalog.display(), e),
            })?;

        let clip_dir = clip_dir.as_ref();
        let mut total = 0;
        let mut recorded = 0;
        let mut lines = BTreeMap::new();
        for (category, texts) in raw {
            let mut entries = Vec::with_capacity(texts.len());
            for (offset, text) in texts.into_iter().enumerate() {
                total += 1;
                let file_name = clip_file_name(&category, offset + 1);
                let path = clip_dir.join(&file_name);
                let clip = if path.exists() {
                    match read_duration(&path) {
                        Ok(duration) => {
                            recorded += 1;
                            Some(ClipRef {
                                key: file_name,
                                path,
                                duration,
                            })
                        }
                        Err(e) => {
                            warn!("[VoiceBank] Unreadable clip {}: {}", path.display(), e);
                            None
                        }
                    }
                } else {
                    None
                };
                entries.push(VoiceLine { text, clip });
            }
            lines.insert(category, entries);
        }

        info!("[VoiceBank] Loaded {}/{} recorded phrases", recorded, total);
        Ok(Self { lines })
    }

    pub fn categories(&self) -> Vec<&str> {
        self.lines.keys().map(String::as_str).collect()
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.lines.get(category).is_some_and(|lines| !lines.is_empty())
    }

    pub fn lines(&self, category: &str) -> &[VoiceLine] {
        self.lines.get(category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Random phrase from `category`.
    pub fn pick(&self, category: &str) -> Option<Phrase> {
        self.lines(category)
            .choose(&mut rand::thread_rng())
            .map(Phrase::from)
    }
}

/// File name of the recording for the `index`-th (1-based) phrase of `category`.
pub fn clip_file_name(category: &str, index: usize) -> String {
    format!("{}_{:02}.wav", category.replace('_', "-"), index)
}

/// Clip duration from the WAV header.
pub fn read_duration(path: &Path) -> Result<Duration, PlaybackError> {
    let reader = hound::WavReader::open(path)?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        return Err(PlaybackError::Decode {
            reason: format!("{}: zero sample rate", path.display()),
        });
    }
    Ok(Duration::from_secs_f64(reader.duration() as f64 / rate as f64))
}

/// Praise category for the current streak of correct answers.
pub fn success_category(streak: u32) -> &'static str {
    match streak {
        0 => choose(&["success_basic", "success_medium"]),
        1 => "success_medium",
        2 => choose(&["success_high", "success_personalized"]),
        _ => "success_streak",
    }
}

/// Encouragement category for the attempt count on the current problem.
pub fn wrong_category(attempts: u32) -> &'static str {
    match attempts {
        0 | 1 => "wrong_gentle",
        2 => "wrong_encouraging",
        _ => "wrong_supportive",
    }
}

pub fn hint_category(level: u32) -> &'static str {
    match level {
        0 | 1 => "hints_basic",
        2 => "hints_advanced",
        _ => "hints_together",
    }
}

fn choose(options: &[&'static str]) -> &'static str {
    options
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(options[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sample_rate: u32, frames: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_clip_file_name() {
        assert_eq!(clip_file_name("success_high", 3), "success-high_03.wav");
    }

    #[test]
    fn test_load_attaches_recorded_clips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("voice_bank.json");
        fs::write(
            &catalog,
            r#"{"welcome": ["Hello!", "Hi again!"], "farewell": ["Bye!"]}"#,
        )
        .unwrap();
        write_wav(&dir.path().join("welcome_01.wav"), 8000, 4000);

        let bank = VoiceBank::load(&catalog, dir.path()).unwrap();
        assert_eq!(bank.categories(), vec!["farewell", "welcome"]);

        let welcome = bank.lines("welcome");
        let clip = welcome[0].clip.as_ref().unwrap();
        assert_eq!(clip.key, "welcome_01.wav");
        assert_eq!(clip.duration, Duration::from_millis(500));
        assert!(welcome[1].clip.is_none());
        assert_eq!(bank.pick("farewell"), Some(Phrase::Text("Bye!".to_string())));
    }

    #[test]
    fn test_load_reports_missing_and_corrupt_catalogs() {
        let dir = tempfile::tempdir().unwrap();
        let missing = VoiceBank::load(dir.path().join("absent.json"), dir.path()).unwrap_err();
        assert!(matches!(missing, PlaybackError::MissingSource { .. }));

        let catalog = dir.path().join("bad.json");
        fs::write(&catalog, "not json").unwrap();
        let corrupt = VoiceBank::load(&catalog, dir.path()).unwrap_err();
        assert!(matches!(corrupt, PlaybackError::Decode { .. }));
    }

    #[test]
    fn test_category_policy() {
        assert_eq!(success_category(1), "success_medium");
        assert_eq!(success_category(5), "success_streak");
        assert!(["success_basic", "success_medium"].contains(&success_category(0)));
        assert!(["success_high", "success_personalized"].contains(&success_category(2)));
        assert_eq!(wrong_category(1), "wrong_gentle");
        assert_eq!(wrong_category(2), "wrong_encouraging");
        assert_eq!(wrong_category(4), "wrong_supportive");
        assert_eq!(hint_category(1), "hints_basic");
        assert_eq!(hint_category(3), "hints_together");
    }

    #[test]
    fn test_builtin_covers_policy_categories() {
        let bank = VoiceBank::builtin();
        for streak in 0..5 {
            assert!(bank.has_category(success_category(streak)));
        }
        for attempts in 0..5 {
            assert!(bank.has_category(wrong_category(attempts)));
            assert!(bank.has_category(hint_category(attempts)));
        }
        assert!(bank.pick(WELCOME).is_some());
        assert!(bank.pick("unknown").is_none());
    }
}
