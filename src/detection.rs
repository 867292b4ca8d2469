use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::audio_processor::AudioFormat;
use crate::config::{AudioConfig, DetectorConfig};
use crate::error::InputError;
use crate::feature_extractor::FeatureExtractor;
use crate::model_inference::{Prediction, VoiceModel};
use crate::registry::ModelRegistry;
use crate::{Classification, DetectionError, Result};

/// Per-request progress. Each step either advances or fails the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStage {
    Received,
    SizeValidated,
    FeaturesExtracted,
    Normalized,
    Classified,
    ResultBuilt,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassProbabilities {
    pub human: f64,
    pub ai_generated: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub status: &'static str,
    pub classification: Classification,
    #[serde(rename = "confidence_score")]
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
    pub language: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl DetectionResult {
    fn from_prediction(prediction: Prediction, language: String) -> Self {
        let confidence = prediction.confidence();
        Self {
            status: "success",
            classification: prediction.classification,
            confidence,
            probabilities: ClassProbabilities {
                human: prediction.probability_of(Classification::Human),
                ai_generated: prediction.probability_of(Classification::AiGenerated),
            },
            language,
            timestamp: Utc::now(),
            message: format!(
                "Audio classified as {} with {:.1}% confidence",
                prediction.classification,
                confidence * 100.0
            ),
        }
    }
}

/// Entry point for the transport layer: bytes in, [`DetectionResult`] out.
///
/// Audio is handled purely in memory. The model comes from the injected
/// [`ModelRegistry`], so tests can supply a fixture instead of files.
pub struct DetectionService {
    audio: AudioConfig,
    extractor: FeatureExtractor,
    registry: Arc<ModelRegistry>,
}

impl DetectionService {
    /// Builds a service around an existing registry. The configuration is
    /// validated first; an inconsistent extractor setup is rejected here
    /// rather than failing every request.
    pub fn new(config: &DetectorConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            audio: config.audio.clone(),
            extractor: FeatureExtractor::new(&config.audio, &config.extractor),
            registry,
        })
    }

    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        Self::new(config, Arc::new(ModelRegistry::from_config(config)))
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn detect(&self, bytes: &[u8], format: &str, language: &str) -> Result<DetectionResult> {
        self.run(Cow::Borrowed(bytes), format, language)
    }

    /// Same as [`detect`](Self::detect), but the payload is moved into the
    /// decoder instead of copied.
    pub fn detect_owned(&self, bytes: Vec<u8>, format: &str, language: &str) -> Result<DetectionResult> {
        self.run(Cow::Owned(bytes), format, language)
    }

    fn run(&self, bytes: Cow<'_, [u8]>, format: &str, language: &str) -> Result<DetectionResult> {
        let mut stage = DetectionStage::Received;
        debug!("[{:?}] {} bytes, format={}, language={}", stage, bytes.len(), format, language);

        let (format, language) = self.validate(&bytes, format, language)?;
        stage = DetectionStage::SizeValidated;
        debug!("[{:?}]", stage);

        let features = match bytes {
            Cow::Borrowed(bytes) => self.extractor.extract(bytes, format)?,
            Cow::Owned(bytes) => self.extractor.extract_owned(bytes, format)?,
        };
        stage = DetectionStage::FeaturesExtracted;
        debug!("[{:?}]", stage);

        let model = self.model()?;
        let scaled = model.normalize(&features)?;
        stage = DetectionStage::Normalized;
        debug!("[{:?}]", stage);

        let prediction = model.classify_scaled(scaled.view())?;
        stage = DetectionStage::Classified;
        debug!("[{:?}] probabilities={:?}", stage, prediction.probabilities);

        let result = DetectionResult::from_prediction(prediction, language);
        stage = DetectionStage::ResultBuilt;
        debug!("[{:?}]", stage);

        info!("{}", result.message);
        Ok(result)
    }

    /// Same as [`detect`](Self::detect) for base64-encoded audio.
    pub fn detect_base64(&self, encoded: &str, format: &str, language: &str) -> Result<DetectionResult> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(InputError::Empty.into());
        }
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| InputError::MalformedEncoding(e.to_string()))?;
        self.detect_owned(bytes, format, language)
    }

    /// Runs [`detect`](Self::detect) on the blocking pool and gives up after `timeout`.
    ///
    /// A timed-out extraction keeps running to completion in the background
    /// but holds nothing beyond its own buffers.
    pub async fn detect_with_timeout(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        format: String,
        language: String,
        timeout: Duration,
    ) -> Result<DetectionResult> {
        let service = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || service.detect_owned(bytes, &format, &language));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DetectionError::Classification(format!(
                "detection task failed: {}",
                join_err
            ))),
            Err(_) => {
                warn!("Detection timed out after {:?}", timeout);
                Err(DetectionError::Timeout(timeout))
            }
        }
    }

    /// Cheap checks first: byte length, then format and language allow-lists.
    fn validate(&self, bytes: &[u8], format: &str, language: &str) -> Result<(AudioFormat, String)> {
        let len = bytes.len();
        if len < self.audio.min_audio_bytes {
            return Err(InputError::TooSmall {
                min: self.audio.min_audio_bytes,
                got: len,
            }
            .into());
        }
        if len > self.audio.max_audio_bytes {
            return Err(InputError::TooLarge {
                max: self.audio.max_audio_bytes,
                got: len,
            }
            .into());
        }

        let allowed_format = self
            .audio
            .supported_formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(format.trim()));
        if !allowed_format {
            return Err(InputError::UnsupportedFormat(format.to_string()).into());
        }
        let format: AudioFormat = format.parse()?;

        let language = language.trim().to_lowercase();
        if !self.audio.supported_languages.iter().any(|l| l.eq_ignore_ascii_case(&language)) {
            return Err(InputError::UnsupportedLanguage(language).into());
        }

        Ok((format, language))
    }

    /// Current model snapshot. A missing model triggers one initialisation
    /// and one retry; a second failure is fatal for this request.
    fn model(&self) -> Result<Arc<VoiceModel>> {
        match self.registry.current() {
            Ok(model) => Ok(model),
            Err(DetectionError::ModelNotReady(reason)) => {
                info!("Model not ready ({}); initialising", reason);
                self.registry.ensure_ready()?;
                self.registry.current().map_err(|e| {
                    DetectionError::Classification(format!(
                        "model unavailable after initialisation: {}",
                        e
                    ))
                })
            }
            Err(err) => Err(err),
        }
    }
}
