use chrono::{DateTime, Utc};
use log::info;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::config::ForestConfig;
use crate::feature_extractor::{feature_names, FeatureVector, FEATURE_COUNT};
use crate::forest::RandomForest;
use crate::scaler::StandardScaler;
use crate::{Classification, DetectionError, Result};

/// Where a model's training data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Fitted on synthetic data so the service can run without a corpus.
    SyntheticBootstrap,
    /// Fitted on real labelled recordings.
    LabeledData,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::SyntheticBootstrap => "synthetic_bootstrap",
            Provenance::LabeledData => "labeled_data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub classification: Classification,
    /// Indexed by [`Classification::index`].
    pub probabilities: [f64; 2],
}

impl Prediction {
    /// Probability of the chosen class; never below 0.5.
    pub fn confidence(&self) -> f64 {
        self.probabilities[self.classification.index()]
    }

    pub fn probability_of(&self, class: Classification) -> f64 {
        self.probabilities[class.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

/// A fitted scaler and forest, immutable once built. Shared read-only
/// between concurrent predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceModel {
    provenance: Provenance,
    trained_at: DateTime<Utc>,
    training_samples: usize,
    scaler: StandardScaler,
    forest: RandomForest,
}

impl VoiceModel {
    pub fn fit(
        features: &Array2<f64>,
        labels: &[Classification],
        provenance: Provenance,
        config: &ForestConfig,
    ) -> Result<Self> {
        if features.ncols() != FEATURE_COUNT {
            return Err(DetectionError::DimensionMismatch {
                expected: FEATURE_COUNT,
                got: features.ncols(),
            });
        }

        let scaler = StandardScaler::fit(features)?;
        let scaled = scaler.transform_batch(features)?;
        let forest = RandomForest::fit(&scaled, labels, config)?;

        info!(
            "Trained {} model on {} samples ({} trees)",
            provenance.as_str(),
            features.nrows(),
            forest.trees().len()
        );

        Ok(Self {
            provenance,
            trained_at: Utc::now(),
            training_samples: features.nrows(),
            scaler,
            forest,
        })
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn training_samples(&self) -> usize {
        self.training_samples
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn forest(&self) -> &RandomForest {
        &self.forest
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<Prediction> {
        let scaled = self.normalize(features)?;
        self.classify_scaled(scaled.view())
    }

    pub fn normalize(&self, features: &FeatureVector) -> Result<Array1<f64>> {
        self.scaler.transform(features.view())
    }

    /// Classifies an already standardised vector.
    pub fn classify_scaled(&self, scaled: ArrayView1<f64>) -> Result<Prediction> {
        let probabilities = self.forest.predict_proba(scaled)?;

        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(DetectionError::Classification(
                "forest produced non-finite probabilities".to_string(),
            ));
        }

        // Argmax; an exact tie goes to the lower index, HUMAN.
        let classification = if probabilities[Classification::AiGenerated.index()]
            > probabilities[Classification::Human.index()]
        {
            Classification::AiGenerated
        } else {
            Classification::Human
        };

        Ok(Prediction {
            classification,
            probabilities,
        })
    }

    /// (feature name, importance) pairs, most important first.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut pairs: Vec<(String, f64)> = feature_names()
            .into_iter()
            .zip(self.forest.feature_importances().iter().copied())
            .collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
        pairs
    }

    /// Scores the model on held-out data with AI_GENERATED as the positive class.
    pub fn evaluate(&self, features: &Array2<f64>, labels: &[Classification]) -> Result<EvaluationMetrics> {
        if features.nrows() != labels.len() {
            return Err(DetectionError::Classification(format!(
                "{} samples but {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        if labels.is_empty() {
            return Err(DetectionError::Classification("empty evaluation set".to_string()));
        }

        let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
        for (row, &actual) in features.rows().into_iter().zip(labels) {
            let vector = FeatureVector::new(row.to_vec())?;
            let predicted = self.predict(&vector)?.classification;
            match (predicted, actual) {
                (Classification::AiGenerated, Classification::AiGenerated) => tp += 1,
                (Classification::AiGenerated, Classification::Human) => fp += 1,
                (Classification::Human, Classification::Human) => tn += 1,
                (Classification::Human, Classification::AiGenerated) => fn_ += 1,
            }
        }

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1_score = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        Ok(EvaluationMetrics {
            accuracy: ratio(tp + tn, labels.len()),
            precision,
            recall,
            f1_score,
        })
    }

    /// Structural checks for a model read back from storage.
    pub(crate) fn validate(&self) -> Result<()> {
        self.scaler.validate()?;
        self.forest.validate()?;
        if self.scaler.dimension() != FEATURE_COUNT || self.forest.n_features() != FEATURE_COUNT {
            return Err(DetectionError::DimensionMismatch {
                expected: FEATURE_COUNT,
                got: self.scaler.dimension(),
            });
        }
        Ok(())
    }
}
