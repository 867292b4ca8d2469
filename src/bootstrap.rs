//! Synthetic training set for a first-run model.
//!
//! Without a labelled corpus the service still needs *some* model, so one is
//! fitted on features drawn from two parametric distributions per feature group:
//!
//! | positions | AI_GENERATED          | HUMAN                 |
//! |-----------|-----------------------|-----------------------|
//! | 0..20     | Normal(0, 10)         | Normal(0, 15)         |
//! | 20..40    | Uniform(0.5, 3)       | Uniform(3, 8)         |
//! | 40..47    | Uniform(500, 2000)    | Uniform(300, 3000)    |
//! | 47        | Uniform(0.05, 0.15)   | Uniform(0.08, 0.25)   |
//!
//! Synthetic voices are tighter; human voices are wider. The resulting model is
//! tagged [`Provenance::SyntheticBootstrap`] and is not meant for production.

use log::warn;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;

use crate::config::{BootstrapConfig, ForestConfig};
use crate::feature_extractor::FEATURE_COUNT;
use crate::model_inference::{Provenance, VoiceModel};
use crate::{Classification, DetectionError, Result};

#[derive(Debug, Clone, Copy)]
enum Distribution {
    Normal { mean: f64, std: f64 },
    Uniform { low: f64, high: f64 },
}

struct FeatureGroup {
    positions: Range<usize>,
    ai: Distribution,
    human: Distribution,
}

const FEATURE_GROUPS: [FeatureGroup; 4] = [
    FeatureGroup {
        positions: 0..20,
        ai: Distribution::Normal { mean: 0.0, std: 10.0 },
        human: Distribution::Normal { mean: 0.0, std: 15.0 },
    },
    FeatureGroup {
        positions: 20..40,
        ai: Distribution::Uniform { low: 0.5, high: 3.0 },
        human: Distribution::Uniform { low: 3.0, high: 8.0 },
    },
    FeatureGroup {
        positions: 40..47,
        ai: Distribution::Uniform { low: 500.0, high: 2000.0 },
        human: Distribution::Uniform { low: 300.0, high: 3000.0 },
    },
    FeatureGroup {
        positions: 47..48,
        ai: Distribution::Uniform { low: 0.05, high: 0.15 },
        human: Distribution::Uniform { low: 0.08, high: 0.25 },
    },
];

impl Distribution {
    fn draw(&self, rng: &mut StdRng) -> f64 {
        match *self {
            Distribution::Normal { mean, std } => {
                // Box-Muller; 1 - u keeps the log argument in (0, 1].
                let u1: f64 = 1.0 - rng.gen::<f64>();
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                mean + std * z
            }
            Distribution::Uniform { low, high } => rng.gen_range(low..high),
        }
    }
}

fn draw_sample(rng: &mut StdRng, class: Classification, row: &mut [f64]) {
    for group in &FEATURE_GROUPS {
        let distribution = match class {
            Classification::AiGenerated => group.ai,
            Classification::Human => group.human,
        };
        for position in group.positions.clone() {
            row[position] = distribution.draw(rng);
        }
    }
}

/// Balanced synthetic training set: the first half AI_GENERATED, the second HUMAN.
pub fn synthesize_training_set(config: &BootstrapConfig) -> Result<(Array2<f64>, Vec<Classification>)> {
    let per_class = config.n_samples / 2;
    if per_class == 0 {
        return Err(DetectionError::Training(format!(
            "bootstrap needs at least 2 samples, got {}",
            config.n_samples
        )));
    }

    let n_samples = per_class * 2;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut features = Array2::zeros((n_samples, FEATURE_COUNT));
    let mut labels = Vec::with_capacity(n_samples);

    for (i, mut row) in features.rows_mut().into_iter().enumerate() {
        let class = if i < per_class {
            Classification::AiGenerated
        } else {
            Classification::Human
        };
        let slice = row
            .as_slice_mut()
            .ok_or_else(|| DetectionError::Training("non-contiguous training row".to_string()))?;
        draw_sample(&mut rng, class, slice);
        labels.push(class);
    }

    Ok((features, labels))
}

/// Fits a scaler and forest on the synthetic set.
pub fn fit_bootstrap_model(bootstrap: &BootstrapConfig, forest: &ForestConfig) -> Result<VoiceModel> {
    warn!("No trained model found. Fitting an initial model on synthetic data.");
    warn!("For production use, retrain with real labeled data!");

    let (features, labels) = synthesize_training_set(bootstrap)?;
    VoiceModel::fit(&features, &labels, Provenance::SyntheticBootstrap, forest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_cover_every_feature_once() {
        let mut covered = [0usize; FEATURE_COUNT];
        for group in &FEATURE_GROUPS {
            for position in group.positions.clone() {
                covered[position] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn training_set_is_balanced() {
        let (features, labels) = synthesize_training_set(&BootstrapConfig::default()).unwrap();
        assert_eq!(features.dim(), (100, FEATURE_COUNT));
        let ai = labels.iter().filter(|&&c| c == Classification::AiGenerated).count();
        assert_eq!(ai, 50);
        assert_eq!(labels.len() - ai, 50);
    }

    #[test]
    fn samples_fall_in_their_class_ranges() {
        let (features, labels) = synthesize_training_set(&BootstrapConfig::default()).unwrap();
        for (row, class) in features.rows().into_iter().zip(&labels) {
            let (std_range, zcr_range) = match class {
                Classification::AiGenerated => (0.5..3.0, 0.05..0.15),
                Classification::Human => (3.0..8.0, 0.08..0.25),
            };
            assert!((20..40).all(|i| std_range.contains(&row[i])));
            assert!(zcr_range.contains(&row[47]));
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn same_seed_gives_same_data() {
        let config = BootstrapConfig::default();
        let (a, _) = synthesize_training_set(&config).unwrap();
        let (b, _) = synthesize_training_set(&config).unwrap();
        assert_eq!(a, b);

        let (c, _) = synthesize_training_set(&BootstrapConfig { seed: 7, ..config }).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn too_few_samples_is_an_error() {
        let config = BootstrapConfig { n_samples: 1, seed: 42 };
        assert!(synthesize_training_set(&config).is_err());
    }

    #[test]
    fn bootstrap_model_is_flagged() {
        let model = fit_bootstrap_model(&BootstrapConfig::default(), &ForestConfig::default()).unwrap();
        assert_eq!(model.provenance(), Provenance::SyntheticBootstrap);
        assert_eq!(model.training_samples(), 100);
    }
}
