//! Feature extraction for outlier scoring
//!
//! Every record maps to the same two features: response time magnitude and
//! a binary error flag. Any finite, non-negative response time is valid,
//! however large.

use crate::models::{ApiRecord, FeatureVector};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("record {index} has non-finite response time")]
    NonFiniteResponseTime { index: usize },
    #[error("record {index} has negative response time {value}ms")]
    NegativeResponseTime { index: usize, value: f64 },
}

/// Extracts scorer features from API records
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, record: &ApiRecord) -> FeatureVector {
        FeatureVector {
            response_time: record.response_time_ms,
            error_flag: u8::from(record.is_error()),
        }
    }

    /// Extract features for a whole segment, failing on the first malformed record
    pub fn extract_all(
        &self,
        records: &[&ApiRecord],
    ) -> Result<Vec<FeatureVector>, FeatureError> {
        records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let value = record.response_time_ms;
                if !value.is_finite() {
                    return Err(FeatureError::NonFiniteResponseTime { index });
                }
                if value < 0.0 {
                    return Err(FeatureError::NegativeResponseTime { index, value });
                }
                Ok(self.extract(record))
            })
            .collect()
    }
}

/// Linear-interpolated percentile over unsorted values; `q` is in [0, 1]
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
