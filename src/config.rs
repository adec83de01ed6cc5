//! Runtime configuration for the audiobook pipeline.
//!
//! Every tunable constant of the pipeline lives here so a JSON settings file
//! (or CLI flags) can override it. Missing keys fall back to the defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum characters per synthesis chunk.
    pub chunk_max_chars: usize,
    /// Provider attempts per chunk before a silent placeholder is used.
    pub max_attempts: u32,
    /// First backoff delay; doubles on every further attempt.
    pub backoff_base_ms: u64,
    /// Abandon a job when nobody polled it for this long.
    pub liveness_timeout_secs: u64,
    /// Lead-in silence inserted before every chapter.
    pub chapter_silence_secs: f32,
    /// Silence substituted for empty or failed chunks.
    pub placeholder_silence_secs: f32,
    pub sample_rate: u32,
    pub audio_format: AudioFormat,
    pub voice: String,
    pub rate: String,
    pub workers: usize,
    pub cache_enabled: bool,
    pub cache_dir: PathBuf,
    pub expand_abbreviations: bool,
    /// Merged over the built-in abbreviation dictionary.
    pub extra_abbreviations: BTreeMap<String, String>,
    pub classifier: ClassifierThresholds,
    pub matching: HeadingMatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_max_chars: 2000,
            max_attempts: 3,
            backoff_base_ms: 1000,
            liveness_timeout_secs: 60,
            chapter_silence_secs: 3.0,
            placeholder_silence_secs: 1.0,
            sample_rate: 22050,
            audio_format: AudioFormat::Wav,
            voice: "en".to_string(),
            rate: "+0%".to_string(),
            workers: num_cpus::get(),
            cache_enabled: false,
            cache_dir: PathBuf::from("./tts_cache"),
            expand_abbreviations: true,
            extra_abbreviations: BTreeMap::new(),
            classifier: ClassifierThresholds::default(),
            matching: HeadingMatchConfig::default(),
        }
    }
}

impl Config {
    /// Load a JSON settings file. Absent keys keep their default value.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_max_chars == 0 {
            return Err(PipelineError::Config(
                "chunk_max_chars must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("chapter_silence_secs", self.chapter_silence_secs),
            ("placeholder_silence_secs", self.placeholder_silence_secs),
        ] {
            if !secs.is_finite() {
                return Err(PipelineError::Config(format!(
                    "{} must be a finite number of seconds",
                    name
                )));
            }
        }
        if self.sample_rate == 0 {
            return Err(PipelineError::Config(
                "sample_rate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn chapter_silence(&self) -> Duration {
        seconds(self.chapter_silence_secs)
    }

    pub fn placeholder_silence(&self) -> Duration {
        seconds(self.placeholder_silence_secs)
    }
}

/// Negative, NaN and out-of-range values become zero.
fn seconds(secs: f32) -> Duration {
    Duration::try_from_secs_f32(secs.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Container format of the audio parts and final artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
        }
    }
}

/// Bounded exponential backoff: `base, 2*base, 4*base, ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Config::default().retry_policy()
    }
}

/// Line-pattern thresholds of the content classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    pub min_chars: usize,
    pub min_words: usize,
    pub short_line_chars: usize,
    pub short_line_min_lines: usize,
    pub short_line_ratio: f64,
    pub page_ref_ratio: f64,
    pub bibliography_ratio: f64,
    pub bibliography_min_line_chars: usize,
    /// Page-ref and bibliography ratios only apply above this many lines.
    pub density_min_lines: usize,
    pub colophon_window_chars: usize,
    pub colophon_min_signals: usize,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            min_chars: 100,
            min_words: 30,
            short_line_chars: 15,
            short_line_min_lines: 10,
            short_line_ratio: 0.7,
            page_ref_ratio: 0.4,
            bibliography_ratio: 0.5,
            bibliography_min_line_chars: 40,
            density_min_lines: 5,
            colophon_window_chars: 500,
            colophon_min_signals: 2,
        }
    }
}

/// Fuzzy heading-to-TOC matching thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadingMatchConfig {
    pub min_heading_chars: usize,
    pub word_overlap_ratio: f64,
    pub overlap_min_toc_words: usize,
    /// Headings longer than this are truncated when used as fallback titles.
    pub max_fallback_title_chars: usize,
}

impl Default for HeadingMatchConfig {
    fn default() -> Self {
        Self {
            min_heading_chars: 3,
            word_overlap_ratio: 0.6,
            overlap_min_toc_words: 2,
            max_fallback_title_chars: 150,
        }
    }
}
