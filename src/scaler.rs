use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::{DetectionError, Result};

/// Smallest scale a feature may have. Features with (near) zero variance in
/// the training set are divided by this instead of their standard deviation.
pub const MIN_SCALE: f64 = 1e-8;

/// Per-feature standardisation `(x - mean) / scale`, fitted once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(samples: &Array2<f64>) -> Result<Self> {
        if samples.nrows() == 0 || samples.ncols() == 0 {
            return Err(DetectionError::Training(
                "cannot fit scaler on an empty matrix".to_string(),
            ));
        }

        let mean = samples
            .mean_axis(Axis(0))
            .ok_or_else(|| DetectionError::Training("empty training matrix".to_string()))?;
        let std = samples.std_axis(Axis(0), 0.0);

        if let Some(index) = mean.iter().position(|m| !m.is_finite()) {
            return Err(DetectionError::Training(format!(
                "feature {} has a non-finite mean",
                index
            )));
        }

        Ok(Self {
            mean: mean.to_vec(),
            scale: std.iter().map(|&s| s.max(MIN_SCALE)).collect(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn transform(&self, features: ArrayView1<f64>) -> Result<Array1<f64>> {
        if features.len() != self.dimension() {
            return Err(DetectionError::DimensionMismatch {
                expected: self.dimension(),
                got: features.len(),
            });
        }

        Ok(features
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(&x, (&mean, &scale))| (x - mean) / scale)
            .collect())
    }

    pub fn transform_batch(&self, samples: &Array2<f64>) -> Result<Array2<f64>> {
        if samples.ncols() != self.dimension() {
            return Err(DetectionError::DimensionMismatch {
                expected: self.dimension(),
                got: samples.ncols(),
            });
        }

        let mean = ArrayView1::from(&self.mean[..]);
        let scale = ArrayView1::from(&self.scale[..]);
        Ok((samples - &mean) / &scale)
    }

    /// Checks a deserialized scaler before use.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.mean.len() != self.scale.len() {
            return Err(DetectionError::Storage(format!(
                "scaler has {} means but {} scales",
                self.mean.len(),
                self.scale.len()
            )));
        }
        if self.scale.iter().any(|&s| !(s >= MIN_SCALE) || !s.is_finite()) {
            return Err(DetectionError::Storage("scaler has an invalid scale".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn fit_computes_population_mean_and_std() {
        let samples = array![[1.0, 10.0], [3.0, 10.0], [5.0, 10.0]];
        let scaler = StandardScaler::fit(&samples).unwrap();
        assert_eq!(scaler.mean(), &[3.0, 10.0]);
        assert!((scaler.scale()[0] - (8.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn zero_variance_feature_uses_min_scale() {
        let samples = array![[1.0, 7.0], [2.0, 7.0]];
        let scaler = StandardScaler::fit(&samples).unwrap();
        assert_eq!(scaler.scale()[1], MIN_SCALE);

        let out = scaler.transform(array![1.5, 7.0].view()).unwrap();
        assert_eq!(out[1], 0.0);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn transform_is_elementwise_and_pure() {
        let samples = array![[0.0, 2.0, -4.0], [2.0, 6.0, 4.0]];
        let scaler = StandardScaler::fit(&samples).unwrap();
        let input = array![3.0, 1.0, 0.0];

        let first = scaler.transform(input.view()).unwrap();
        let second = scaler.transform(input.view()).unwrap();
        assert_eq!(first, second);

        for i in 0..3 {
            let expected = (input[i] - scaler.mean()[i]) / scaler.scale()[i];
            assert_eq!(first[i], expected);
        }
    }

    #[test]
    fn batch_transform_matches_single() {
        let samples = array![[1.0, 2.0], [3.0, 5.0], [8.0, 1.0]];
        let scaler = StandardScaler::fit(&samples).unwrap();
        let batch = scaler.transform_batch(&samples).unwrap();
        for (row, expected) in samples.rows().into_iter().zip(batch.rows()) {
            assert_eq!(scaler.transform(row).unwrap(), expected);
        }
    }

    #[test]
    fn transform_rejects_wrong_dimension() {
        let scaler = StandardScaler::fit(&array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        let err = scaler.transform(array![1.0, 2.0, 3.0].view()).unwrap_err();
        assert!(matches!(
            err,
            DetectionError::DimensionMismatch { expected: 2, got: 3 }
        ));
    }

    #[test]
    fn fit_rejects_empty_matrix() {
        assert!(StandardScaler::fit(&Array2::<f64>::zeros((0, 48))).is_err());
    }
}
