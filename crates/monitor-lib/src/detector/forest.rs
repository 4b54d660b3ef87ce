//! Isolation forest outlier scorer
//!
//! Each tree recursively splits a random subsample on a random feature at a
//! random threshold. Points that are isolated after few splits receive short
//! path lengths and therefore high anomaly scores. The decision threshold is
//! calibrated at fit time so that the configured contamination fraction of
//! the training data lands on the outlier side.

use super::features::quantile;
use super::{OutlierLabel, OutlierScore, OutlierScorer};
use crate::models::FeatureVector;
use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Hyperparameters for the forest
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    /// Number of trees in the ensemble
    pub n_estimators: usize,
    /// Subsample size drawn for each tree (capped at the training set size)
    pub max_samples: usize,
    /// Expected fraction of outliers in the training data
    pub contamination: f64,
    /// Seed for the split RNG; fixed so retraining on equal data is reproducible
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_samples: 256,
            contamination: 0.05,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    root: Node,
}

impl IsolationTree {
    fn build(
        points: &[[f64; FeatureVector::DIMENSIONS]],
        height_limit: usize,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            root: build_node(points, 0, height_limit, rng),
        }
    }

    fn path_length(&self, point: &[f64; FeatureVector::DIMENSIONS]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[*feature] <= *threshold { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

fn build_node(
    points: &[[f64; FeatureVector::DIMENSIONS]],
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if depth >= height_limit || points.len() <= 1 {
        return Node::Leaf { size: points.len() };
    }

    // Only features that still vary within this node can separate points
    let candidates: Vec<(usize, f64, f64)> = (0..FeatureVector::DIMENSIONS)
        .filter_map(|feature| {
            let (min, max) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p[feature]), hi.max(p[feature]))
            });
            (max > min).then_some((feature, min, max))
        })
        .collect();

    if candidates.is_empty() {
        return Node::Leaf { size: points.len() };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    // threshold in [min, max): `<=` keeps both children non-empty
    let threshold = min + rng.gen::<f64>() * (max - min);

    let (left, right): (Vec<_>, Vec<_>) = points
        .iter()
        .copied()
        .partition(|p| p[feature] <= threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_node(&left, depth + 1, height_limit, rng)),
        right: Box::new(build_node(&right, depth + 1, height_limit, rng)),
    }
}

/// Average path length of an unsuccessful BST search over `n` points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Isolation forest scorer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    params: ForestParams,
    trees: Vec<IsolationTree>,
    /// Subsample size actually used per tree
    sample_size: usize,
    /// Raw score below which a point is labeled an outlier
    offset: f64,
}

impl IsolationForest {
    pub fn new(params: ForestParams) -> Self {
        Self {
            params,
            trees: Vec::new(),
            sample_size: 0,
            offset: 0.0,
        }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Calibrated decision offset
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Raw score in [-1, 0); lower means more anomalous
    fn raw_score(&self, point: &[f64; FeatureVector::DIMENSIONS]) -> f64 {
        let total_depth: f64 = self.trees.iter().map(|t| t.path_length(point)).sum();
        let mean_depth = total_depth / self.trees.len() as f64;
        let normalizer = average_path_length(self.sample_size).max(f64::EPSILON);
        -(2f64.powf(-mean_depth / normalizer))
    }
}

impl OutlierScorer for IsolationForest {
    fn fit(&mut self, features: &[FeatureVector]) -> Result<()> {
        if features.is_empty() {
            bail!("Cannot fit isolation forest on an empty feature set");
        }
        if self.params.n_estimators == 0 {
            bail!("Isolation forest needs at least one estimator");
        }
        if !(0.0..=0.5).contains(&self.params.contamination) {
            bail!(
                "Contamination must be within [0, 0.5], got {}",
                self.params.contamination
            );
        }

        let points: Vec<[f64; FeatureVector::DIMENSIONS]> =
            features.iter().map(FeatureVector::as_array).collect();
        let sample_size = self.params.max_samples.clamp(1, points.len());
        let height_limit = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        let trees: Vec<IsolationTree> = (0..self.params.n_estimators)
            .map(|_| {
                let subsample: Vec<[f64; FeatureVector::DIMENSIONS]> =
                    rand::seq::index::sample(&mut rng, points.len(), sample_size)
                        .iter()
                        .map(|i| points[i])
                        .collect();
                IsolationTree::build(&subsample, height_limit, &mut rng)
            })
            .collect();

        self.trees = trees;
        self.sample_size = sample_size;

        let training_scores: Vec<f64> = points.iter().map(|p| self.raw_score(p)).collect();
        self.offset = quantile(&training_scores, self.params.contamination);

        Ok(())
    }

    fn score(&self, features: &FeatureVector) -> Result<OutlierScore> {
        if !self.is_fitted() {
            bail!("Isolation forest has not been fitted");
        }
        let value = self.raw_score(&features.as_array()) - self.offset;
        let label = if value < 0.0 {
            OutlierLabel::Outlier
        } else {
            OutlierLabel::Inlier
        };
        Ok(OutlierScore { label, value })
    }

    fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }
}
