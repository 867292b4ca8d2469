use std::time::Duration;
use thiserror::Error;

/// Caller-supplied input rejected before any decoding happens.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("audio too small: need at least {min} bytes, got {got}")]
    TooSmall { min: usize, got: usize },

    #[error("audio too large: at most {max} bytes allowed, got {got}")]
    TooLarge { max: usize, got: usize },

    #[error("audio payload is empty")]
    Empty,

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid base64 encoding: {0}")]
    MalformedEncoding(String),
}

/// Decoding or DSP failure. Retrying with the same bytes reproduces it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    #[error("failed to decode audio: {0}")]
    Decode(String),

    #[error("no decodable audio track found")]
    NoAudioTrack,

    #[error("unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("decoded signal is empty")]
    EmptySignal,

    #[error("feature {index} is not finite")]
    NonFinite { index: usize },

    #[error("feature vector must have {expected} values, got {got}")]
    Dimension { expected: usize, got: usize },
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InputError),

    #[error("feature extraction failed: {0}")]
    FeatureExtraction(#[from] ExtractionError),

    #[error("model not ready: {0}")]
    ModelNotReady(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("classification failed: {0}")]
    Classification(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("model storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("detection timed out after {0:?}")]
    Timeout(Duration),
}

impl DetectionError {
    /// True when the request itself was at fault (bad bytes, bad format).
    /// Everything else is an internal failure of the service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DetectionError::InvalidInput(_) | DetectionError::FeatureExtraction(_)
        )
    }
}

impl From<std::io::Error> for DetectionError {
    fn from(err: std::io::Error) -> Self {
        DetectionError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DetectionError {
    fn from(err: serde_json::Error) -> Self {
        DetectionError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_client_errors() {
        let err: DetectionError = InputError::TooSmall { min: 1024, got: 500 }.into();
        assert!(err.is_client_error());
        assert_eq!(
            err.to_string(),
            "invalid input: audio too small: need at least 1024 bytes, got 500"
        );

        let err: DetectionError = ExtractionError::EmptySignal.into();
        assert!(err.is_client_error());
    }

    #[test]
    fn internal_errors_are_not_client_errors() {
        let err = DetectionError::DimensionMismatch { expected: 48, got: 47 };
        assert!(!err.is_client_error());
        assert!(!DetectionError::ModelNotReady("empty".into()).is_client_error());
        assert!(!DetectionError::Timeout(Duration::from_secs(1)).is_client_error());
    }
}
