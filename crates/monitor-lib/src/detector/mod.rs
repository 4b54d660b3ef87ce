//! Per-segment outlier detection
//!
//! This module provides:
//! - Feature extraction from API records
//! - An isolation forest scorer behind the `OutlierScorer` trait
//! - Training and detection across dynamically discovered segments

mod engine;
mod features;
mod forest;

#[cfg(test)]
mod tests;

pub use engine::{classify_anomaly, AnomalyDetector, DetectionReport, SYNTHETIC_LANGUAGE};
pub use features::{quantile, FeatureError, FeatureExtractor};
pub use forest::{ForestParams, IsolationForest};

use crate::models::FeatureVector;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Scorer used for every segment; swap the alias to change the algorithm
pub type SegmentScorer = IsolationForest;

/// In/out-of-distribution label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierLabel {
    Inlier,
    Outlier,
}

/// Result of scoring one feature vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierScore {
    pub label: OutlierLabel,
    /// Decision value; negative for outliers, more negative is more anomalous
    pub value: f64,
}

/// Trait for unsupervised outlier scorers
pub trait OutlierScorer: Send + Sync {
    /// Fit the scorer on training features, replacing any previous fit
    fn fit(&mut self, features: &[FeatureVector]) -> Result<()>;

    /// Score a single feature vector
    fn score(&self, features: &FeatureVector) -> Result<OutlierScore>;

    /// Whether `fit` has completed successfully
    fn is_fitted(&self) -> bool;
}

/// Configuration for training and detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Expected anomaly proportion in training data
    pub contamination: f64,
    /// Ensemble size
    pub n_estimators: usize,
    /// Per-tree subsample size
    pub max_samples: usize,
    /// Latency threshold; flagged records above twice this value are `high_latency`
    pub latency_threshold_ms: f64,
    /// Minimum corpus size accepted by `train`
    pub min_training_records: usize,
    /// Segments with fewer records are skipped during training
    pub min_segment_records: usize,
    /// Synthetic anomalies are injected when the corpus has fewer error records than this
    pub min_error_records: usize,
    /// Number of synthetic anomalies injected
    pub synthetic_anomaly_count: usize,
    /// Seed for scorer fitting and synthetic injection
    pub random_seed: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            contamination: 0.05,
            n_estimators: 200,
            max_samples: 256,
            latency_threshold_ms: 500.0,
            min_training_records: 1000,
            min_segment_records: 50,
            min_error_records: 50,
            synthetic_anomaly_count: 100,
            random_seed: 42,
        }
    }
}

impl DetectionConfig {
    pub fn forest_params(&self) -> ForestParams {
        ForestParams {
            n_estimators: self.n_estimators,
            max_samples: self.max_samples,
            contamination: self.contamination,
            seed: self.random_seed,
        }
    }
}
