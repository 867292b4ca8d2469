//! Runtime configuration for the detector.
//!
//! Everything has a default matching the reference deployment; a JSON file
//! may override any subset of fields.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::feature_extractor::{FEATURE_COUNT, N_MFCC};
use crate::{DetectionError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub audio: AudioConfig,
    pub extractor: ExtractorConfig,
    pub forest: ForestConfig,
    pub bootstrap: BootstrapConfig,
    /// Directory holding the persisted model bundle. `None` keeps models in memory only.
    pub model_dir: Option<PathBuf>,
    pub detect_timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            extractor: ExtractorConfig::default(),
            forest: ForestConfig::default(),
            bootstrap: BootstrapConfig::default(),
            model_dir: Some(PathBuf::from("models")),
            detect_timeout_secs: 30,
        }
    }
}

/// Input acceptance policy and decode target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Longer clips are truncated to this many seconds.
    pub max_duration_secs: f32,
    pub min_audio_bytes: usize,
    pub max_audio_bytes: usize,
    pub supported_formats: Vec<String>,
    pub supported_languages: Vec<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            max_duration_secs: 10.0,
            min_audio_bytes: 1024,
            max_audio_bytes: 25 * 1024 * 1024,
            supported_formats: ["mp3", "wav", "ogg", "flac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            supported_languages: ["tamil", "english", "hindi", "malayalam", "telugu"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub n_mfcc: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    /// Fraction of spectral magnitude below the rolloff frequency.
    pub rolloff_percent: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            n_mfcc: 20,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            rolloff_percent: 0.85,
        }
    }
}

/// Random forest hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; `None` means sqrt(n_features).
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 20,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: None,
            seed: 42,
        }
    }
}

/// Synthetic training set used when no model exists yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub n_samples: usize,
    pub seed: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_samples: 100,
            seed: 42,
        }
    }
}

impl DetectorConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file is missing or unparsable.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                warn!(
                    "[Config] Could not read {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(DetectionError::Config(msg.to_string()));

        if self.audio.sample_rate == 0 {
            return invalid("sample_rate must be positive");
        }
        if self.audio.max_duration_secs <= 0.0 {
            return invalid("max_duration_secs must be positive");
        }
        if self.audio.min_audio_bytes >= self.audio.max_audio_bytes {
            return invalid("min_audio_bytes must be below max_audio_bytes");
        }
        if self.extractor.n_fft == 0 || self.extractor.hop_length == 0 {
            return invalid("n_fft and hop_length must be positive");
        }
        if self.extractor.n_mfcc != N_MFCC {
            return Err(DetectionError::Config(format!(
                "n_mfcc must be {} to produce {}-value feature vectors, got {}",
                N_MFCC, FEATURE_COUNT, self.extractor.n_mfcc
            )));
        }
        if self.extractor.n_mels < N_MFCC {
            return invalid("n_mels must be at least n_mfcc");
        }
        if !(0.0..=1.0).contains(&self.extractor.rolloff_percent) {
            return invalid("rolloff_percent must be within [0, 1]");
        }
        if self.forest.n_trees == 0 || self.forest.max_depth == 0 {
            return invalid("n_trees and max_depth must be positive");
        }
        if self.forest.min_samples_leaf == 0 {
            return invalid("min_samples_leaf must be positive");
        }
        if self.bootstrap.n_samples < 2 {
            return invalid("bootstrap needs at least two samples");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_policy() {
        let config = DetectorConfig::default();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.max_duration_secs, 10.0);
        assert_eq!(config.audio.min_audio_bytes, 1024);
        assert_eq!(config.audio.max_audio_bytes, 26_214_400);
        assert_eq!(config.forest.n_trees, 100);
        assert_eq!(config.forest.max_depth, 20);
        assert_eq!(config.forest.seed, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"forest": {{"n_trees": 7}}, "model_dir": null}}"#).unwrap();

        let config = DetectorConfig::load_from_file(file.path());
        assert_eq!(config.forest.n_trees, 7);
        assert_eq!(config.forest.max_depth, 20);
        assert!(config.model_dir.is_none());
        assert_eq!(config.audio.supported_formats.len(), 4);
    }

    #[test]
    fn missing_or_broken_file_falls_back_to_defaults() {
        let config = DetectorConfig::load_from_file("/nonexistent/detector.json");
        assert_eq!(config.forest.n_trees, 100);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let config = DetectorConfig::load_from_file(file.path());
        assert_eq!(config.bootstrap.n_samples, 100);
    }

    #[test]
    fn validate_rejects_inverted_size_bounds() {
        let mut config = DetectorConfig::default();
        config.audio.min_audio_bytes = config.audio.max_audio_bytes;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.forest.n_trees = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_pins_mfcc_count_to_feature_layout() {
        let mut config = DetectorConfig::default();
        config.extractor.n_mfcc = 13;
        assert!(matches!(config.validate(), Err(DetectionError::Config(_))));

        let mut config = DetectorConfig::default();
        config.extractor.hop_length = 0;
        assert!(matches!(config.validate(), Err(DetectionError::Config(_))));
    }
}
