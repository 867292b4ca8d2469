pub mod audio_processor;
pub mod bootstrap;
pub mod config;
pub mod detection;
pub mod error;
pub mod feature_extractor;
pub mod forest;
pub mod model_inference;
pub mod model_store;
pub mod registry;
pub mod scaler;
pub mod spectral;

pub use audio_processor::{AudioFormat, AudioProcessor};
pub use config::DetectorConfig;
pub use detection::{DetectionResult, DetectionService};
pub use error::{DetectionError, ExtractionError, InputError};
pub use feature_extractor::{FeatureExtractor, FeatureVector, FEATURE_COUNT};
pub use forest::RandomForest;
pub use model_inference::{EvaluationMetrics, Prediction, Provenance, VoiceModel};
pub use model_store::ModelStore;
pub use registry::ModelRegistry;
pub use scaler::StandardScaler;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Binary outcome of a detection. The discriminant is the class index used by
/// the forest and the scaler-fitted training matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Human = 0,
    AiGenerated = 1,
}

/// Class index <-> label table. Index order matches the probability arrays.
const CLASS_TABLE: [(Classification, &str); 2] = [
    (Classification::Human, "HUMAN"),
    (Classification::AiGenerated, "AI_GENERATED"),
];

impl Classification {
    pub const ALL: [Classification; 2] = [Classification::Human, Classification::AiGenerated];

    pub fn from_index(value: usize) -> Option<Self> {
        CLASS_TABLE.get(value).map(|(class, _)| *class)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        CLASS_TABLE[self.index()].1
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CLASS_TABLE
            .iter()
            .find(|(_, label)| label.eq_ignore_ascii_case(s))
            .map(|(class, _)| *class)
            .ok_or_else(|| format!("unknown classification label: {}", s))
    }
}

pub type Result<T> = std::result::Result<T, DetectionError>;
