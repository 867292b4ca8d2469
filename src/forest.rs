// Bagged CART decision trees for binary classification.
//
// Each tree is grown on a bootstrap resample of the training rows, choosing
// among a random subset of features at every split by Gini impurity. The
// forest's class probabilities are the fraction of trees voting for each class.

use log::debug;
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::ForestConfig;
use crate::{Classification, DetectionError, Result};

const N_CLASSES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        /// Class frequencies of the training rows that reached this leaf.
        distribution: [f64; N_CLASSES],
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

/// Training state shared while one tree is grown.
struct TreeBuilder<'a> {
    features: &'a Array2<f64>,
    labels: &'a [usize],
    config: &'a ForestConfig,
    max_features: usize,
    rng: &'a mut StdRng,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    impurity: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

fn class_counts(labels: &[usize], rows: &[usize]) -> [usize; N_CLASSES] {
    let mut counts = [0; N_CLASSES];
    for &row in rows {
        counts[labels[row]] += 1;
    }
    counts
}

fn gini(counts: &[usize; N_CLASSES], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts
        .iter()
        .map(|&c| {
            let p = c as f64 / total;
            p * p
        })
        .sum::<f64>()
}

impl<'a> TreeBuilder<'a> {
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let counts = class_counts(self.labels, &rows);
        let n = rows.len();
        let pure = counts.iter().any(|&c| c == n);

        if depth >= self.config.max_depth || n < self.config.min_samples_split || pure {
            return self.push_leaf(&counts, n);
        }

        let split = match self.best_split(&rows, &counts) {
            Some(split) => split,
            None => return self.push_leaf(&counts, n),
        };

        let parent_impurity = gini(&counts, n) * n as f64;
        self.importances[split.feature] += (parent_impurity - split.impurity).max(0.0);

        let id = self.nodes.len();
        self.nodes.push(Node::Leaf {
            distribution: [0.0; N_CLASSES],
        });
        let left = self.grow(split.left, depth + 1);
        let right = self.grow(split.right, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }

    fn push_leaf(&mut self, counts: &[usize; N_CLASSES], n: usize) -> usize {
        let mut distribution = [0.0; N_CLASSES];
        if n > 0 {
            for (slot, &count) in distribution.iter_mut().zip(counts) {
                *slot = count as f64 / n as f64;
            }
        }
        self.nodes.push(Node::Leaf { distribution });
        self.nodes.len() - 1
    }

    /// Lowest weighted-Gini split over a random feature subset, honouring
    /// `min_samples_leaf`. Returns `None` when no feature separates the rows.
    fn best_split(&mut self, rows: &[usize], counts: &[usize; N_CLASSES]) -> Option<SplitCandidate> {
        let n = rows.len();
        let min_leaf = self.config.min_samples_leaf;
        if n < 2 * min_leaf {
            return None;
        }

        let n_features = self.features.ncols();
        let candidates = sample(&mut *self.rng, n_features, self.max_features.min(n_features));

        let mut best: Option<(usize, f64, f64)> = None;
        let mut sorted = rows.to_vec();

        for feature in candidates.iter() {
            sorted.sort_by(|&a, &b| {
                self.features[[a, feature]].total_cmp(&self.features[[b, feature]])
            });

            let mut left_counts = [0usize; N_CLASSES];
            for pos in 1..n {
                left_counts[self.labels[sorted[pos - 1]]] += 1;
                if pos < min_leaf || n - pos < min_leaf {
                    continue;
                }

                let prev = self.features[[sorted[pos - 1], feature]];
                let next = self.features[[sorted[pos], feature]];
                if prev >= next {
                    continue;
                }

                let mut right_counts = *counts;
                for (r, l) in right_counts.iter_mut().zip(&left_counts) {
                    *r -= l;
                }
                let impurity = gini(&left_counts, pos) * pos as f64
                    + gini(&right_counts, n - pos) * (n - pos) as f64;

                if best.map_or(true, |(_, _, best_impurity)| impurity < best_impurity) {
                    let mut threshold = prev + (next - prev) / 2.0;
                    if threshold >= next {
                        threshold = prev;
                    }
                    best = Some((feature, threshold, impurity));
                }
            }
        }

        let (feature, threshold, impurity) = best?;
        let (left, right): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&row| self.features[[row, feature]] <= threshold);

        Some(SplitCandidate {
            feature,
            threshold,
            impurity,
            left,
            right,
        })
    }
}

impl DecisionTree {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match &nodes[id] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    /// Leaf class distribution for one sample.
    pub fn predict_distribution(&self, sample: ArrayView1<f64>) -> Result<[f64; N_CLASSES]> {
        let mut id = 0;
        loop {
            match self.nodes.get(id) {
                Some(Node::Leaf { distribution }) => return Ok(*distribution),
                Some(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = sample.get(*feature).ok_or(DetectionError::DimensionMismatch {
                        expected: feature + 1,
                        got: sample.len(),
                    })?;
                    id = if *value <= *threshold { *left } else { *right };
                }
                None => {
                    return Err(DetectionError::Classification(format!(
                        "tree references missing node {}",
                        id
                    )))
                }
            }
        }
    }

    /// Index of the most likely class; ties go to the lower index.
    pub fn predict_class(&self, sample: ArrayView1<f64>) -> Result<usize> {
        let distribution = self.predict_distribution(sample)?;
        Ok(if distribution[1] > distribution[0] { 1 } else { 0 })
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(DetectionError::Storage("tree has no nodes".to_string()));
        }
        for (id, node) in self.nodes.iter().enumerate() {
            if let Node::Split { left, right, .. } = node {
                // Children are always pushed after their parent.
                if *left <= id || *right <= id || *left >= self.nodes.len() || *right >= self.nodes.len() {
                    return Err(DetectionError::Storage(format!(
                        "tree node {} has invalid children",
                        id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    n_features: usize,
    feature_importances: Vec<f64>,
}

impl RandomForest {
    pub fn fit(features: &Array2<f64>, labels: &[Classification], config: &ForestConfig) -> Result<Self> {
        let (n_rows, n_features) = features.dim();
        if n_rows == 0 || n_features == 0 {
            return Err(DetectionError::Training("empty training set".to_string()));
        }
        if labels.len() != n_rows {
            return Err(DetectionError::Training(format!(
                "{} samples but {} labels",
                n_rows,
                labels.len()
            )));
        }
        if config.n_trees == 0 {
            return Err(DetectionError::Training("forest needs at least one tree".to_string()));
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(DetectionError::Training("training features must be finite".to_string()));
        }

        let labels: Vec<usize> = labels.iter().map(|c| c.index()).collect();
        let max_features = config
            .max_features
            .unwrap_or_else(|| (n_features as f64).sqrt() as usize)
            .clamp(1, n_features);

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut trees = Vec::with_capacity(config.n_trees);
        let mut importances = vec![0.0; n_features];

        for _ in 0..config.n_trees {
            let rows: Vec<usize> = (0..n_rows).map(|_| rng.gen_range(0..n_rows)).collect();

            let mut builder = TreeBuilder {
                features,
                labels: &labels,
                config,
                max_features,
                rng: &mut rng,
                nodes: Vec::new(),
                importances: vec![0.0; n_features],
            };
            builder.grow(rows, 0);

            let tree_total: f64 = builder.importances.iter().sum();
            if tree_total > 0.0 {
                for (acc, value) in importances.iter_mut().zip(&builder.importances) {
                    *acc += value / tree_total;
                }
            }
            trees.push(DecisionTree {
                nodes: builder.nodes,
            });
        }

        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }

        debug!(
            "Fitted forest: {} trees, {} features, max depth {}",
            trees.len(),
            n_features,
            trees.iter().map(|t| t.depth()).max().unwrap_or(0)
        );

        Ok(Self {
            trees,
            n_features,
            feature_importances: importances,
        })
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    /// Mean impurity decrease per feature, summing to 1 (all zeros if no tree split).
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// Fraction of trees voting for each class, indexed by [`Classification::index`].
    pub fn predict_proba(&self, sample: ArrayView1<f64>) -> Result<[f64; N_CLASSES]> {
        if sample.len() != self.n_features {
            return Err(DetectionError::DimensionMismatch {
                expected: self.n_features,
                got: sample.len(),
            });
        }
        if self.trees.is_empty() {
            return Err(DetectionError::Classification("forest has no trees".to_string()));
        }

        let mut votes = [0usize; N_CLASSES];
        for tree in &self.trees {
            votes[tree.predict_class(sample)?] += 1;
        }

        let n_trees = self.trees.len() as f64;
        Ok([votes[0] as f64 / n_trees, votes[1] as f64 / n_trees])
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.trees.is_empty() {
            return Err(DetectionError::Storage("forest has no trees".to_string()));
        }
        if self.feature_importances.len() != self.n_features {
            return Err(DetectionError::Storage(
                "feature importances do not match feature count".to_string(),
            ));
        }
        self.trees.iter().try_for_each(DecisionTree::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn separable_data() -> (Array2<f64>, Vec<Classification>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..40 {
            let x = i as f64;
            // Feature 0 separates the classes; feature 1 is noise.
            let label = if i < 20 {
                Classification::Human
            } else {
                Classification::AiGenerated
            };
            rows.extend([x, (i * 7 % 11) as f64, 3.0]);
            labels.push(label);
        }
        (Array2::from_shape_vec((40, 3), rows).unwrap(), labels)
    }

    fn small_config() -> ForestConfig {
        ForestConfig {
            n_trees: 25,
            max_features: Some(3),
            ..ForestConfig::default()
        }
    }

    #[test]
    fn learns_a_separable_problem() {
        let (x, y) = separable_data();
        let forest = RandomForest::fit(&x, &y, &small_config()).unwrap();

        let low = forest.predict_proba(array![2.0, 5.0, 3.0].view()).unwrap();
        let high = forest.predict_proba(array![37.0, 5.0, 3.0].view()).unwrap();
        assert!(low[Classification::Human.index()] > 0.9);
        assert!(high[Classification::AiGenerated.index()] > 0.9);
    }

    #[test]
    fn probabilities_sum_to_one() {
        let (x, y) = separable_data();
        let forest = RandomForest::fit(&x, &y, &small_config()).unwrap();
        for v in [-5.0, 10.0, 19.5, 20.5, 100.0] {
            let proba = forest.predict_proba(array![v, 1.0, 3.0].view()).unwrap();
            assert!((proba[0] + proba[1] - 1.0).abs() < 1e-12);
            assert!(proba[0].max(proba[1]) >= 0.5);
        }
    }

    #[test]
    fn same_seed_gives_identical_forest() {
        let (x, y) = separable_data();
        let a = RandomForest::fit(&x, &y, &small_config()).unwrap();
        let b = RandomForest::fit(&x, &y, &small_config()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn importance_concentrates_on_separating_feature() {
        let (x, y) = separable_data();
        let forest = RandomForest::fit(&x, &y, &small_config()).unwrap();
        let importances = forest.feature_importances();
        assert!((importances.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(importances[0] > importances[1]);
        // Constant feature can never split.
        assert_eq!(importances[2], 0.0);
    }

    #[test]
    fn respects_max_depth() {
        let (x, y) = separable_data();
        let config = ForestConfig {
            max_depth: 1,
            ..small_config()
        };
        let forest = RandomForest::fit(&x, &y, &config).unwrap();
        assert!(forest.trees().iter().all(|t| t.depth() <= 1));
    }

    #[test]
    fn single_class_training_always_predicts_that_class() {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| (i + j) as f64);
        let y = vec![Classification::AiGenerated; 10];
        let forest = RandomForest::fit(&x, &y, &small_config()).unwrap();
        let proba = forest.predict_proba(array![1.0, 2.0].view()).unwrap();
        assert_eq!(proba, [0.0, 1.0]);
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let (x, y) = separable_data();
        assert!(RandomForest::fit(&x, &y[..10], &small_config()).is_err());

        let forest = RandomForest::fit(&x, &y, &small_config()).unwrap();
        let err = forest.predict_proba(Array1::zeros(4).view()).unwrap_err();
        assert!(matches!(err, DetectionError::DimensionMismatch { expected: 3, got: 4 }));
    }

    #[test]
    fn survives_json_round_trip() {
        let (x, y) = separable_data();
        let forest = RandomForest::fit(&x, &y, &small_config()).unwrap();
        let json = serde_json::to_string(&forest).unwrap();
        let restored: RandomForest = serde_json::from_str(&json).unwrap();
        assert!(restored.validate().is_ok());
        assert_eq!(restored, forest);
    }
}
