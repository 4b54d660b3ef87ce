//! Traffic spike detection
//!
//! Request volume per segment is counted in fixed-width, epoch-aligned time
//! windows. Training computes the mean and standard deviation of those
//! counts; monitoring flags any window whose z-score exceeds the threshold.

use crate::models::{Anomaly, ApiRecord, Segment};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Default window width (5 minutes)
const DEFAULT_BUCKET_SECS: u64 = 5 * 60;

/// Windows needed before a baseline carries any signal
const MIN_BASELINE_WINDOWS: usize = 2;

/// Configuration for traffic baselines and spike detection
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Window width used for counting requests
    pub bucket: Duration,
    /// Number of standard deviations above the mean to consider a spike
    pub z_threshold: f64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            bucket: Duration::from_secs(DEFAULT_BUCKET_SECS),
            z_threshold: 3.0, // 3 sigma
        }
    }
}

/// Mean and standard deviation of per-window request counts for one segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficBaseline {
    pub mean: f64,
    pub std: f64,
}

impl TrafficBaseline {
    /// Compute a baseline from one segment's training records.
    ///
    /// Windows between the first and last non-empty window count as zero.
    /// Returns `None` when fewer than two windows are non-empty.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a ApiRecord>,
        bucket: Duration,
    ) -> Option<Self> {
        let counts = bucket_counts(records, bucket);
        if counts.len() < MIN_BASELINE_WINDOWS {
            return None;
        }

        let width = bucket_width_secs(bucket);
        let (first, last) = (*counts.keys().next()?, *counts.keys().next_back()?);
        let windows = ((last - first) / width + 1) as usize;

        let total: u64 = counts.values().sum();
        let mean = total as f64 / windows as f64;

        // empty windows contribute (0 - mean)^2 each
        let empty = windows - counts.len();
        let squared: f64 = counts.values().map(|c| (*c as f64 - mean).powi(2)).sum::<f64>()
            + empty as f64 * mean.powi(2);
        // Sample variance (Bessel's correction)
        let std = (squared / (windows - 1) as f64).sqrt();

        Some(Self { mean, std })
    }

    /// Standardized distance of `count` from the mean.
    ///
    /// A zero-variance baseline makes any count above the mean infinitely unusual.
    pub fn z_score(&self, count: u64) -> f64 {
        let delta = count as f64 - self.mean;
        if self.std < f64::EPSILON {
            return if delta > 0.0 { f64::INFINITY } else { 0.0 };
        }
        delta / self.std
    }
}

fn bucket_width_secs(bucket: Duration) -> i64 {
    (bucket.as_secs() as i64).max(1)
}

/// Request counts keyed by window start (unix seconds)
pub fn bucket_counts<'a>(
    records: impl IntoIterator<Item = &'a ApiRecord>,
    bucket: Duration,
) -> BTreeMap<i64, u64> {
    let width = bucket_width_secs(bucket);
    let mut counts = BTreeMap::new();
    for record in records {
        let start = record.timestamp.timestamp().div_euclid(width) * width;
        *counts.entry(start).or_insert(0) += 1;
    }
    counts
}

/// Flags request-volume spikes against per-segment baselines
pub struct SpikeDetector {
    config: TrafficConfig,
}

impl SpikeDetector {
    pub fn new(config: TrafficConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    /// Detect spikes in a batch; segments without a baseline are skipped
    pub fn detect(
        &self,
        records: &[ApiRecord],
        baselines: &HashMap<Segment, TrafficBaseline>,
    ) -> Vec<Anomaly> {
        let mut by_segment: BTreeMap<Segment, Vec<&ApiRecord>> = BTreeMap::new();
        for record in records {
            by_segment.entry(record.segment()).or_default().push(record);
        }

        let mut spikes = Vec::new();
        for (segment, group) in by_segment {
            let Some(baseline) = baselines.get(&segment) else {
                debug!(segment = %segment, "No traffic baseline, skipping spike detection");
                continue;
            };

            for (start, count) in bucket_counts(group.iter().copied(), self.config.bucket) {
                let z_score = baseline.z_score(count);
                if z_score > self.config.z_threshold {
                    let window_start: DateTime<Utc> =
                        Utc.timestamp_opt(start, 0).single().unwrap_or_default();
                    spikes.push(Anomaly::traffic_spike(
                        segment.clone(),
                        window_start,
                        count,
                        z_score,
                        baseline.mean,
                        baseline.std,
                    ));
                }
            }
        }
        spikes
    }
}

impl Default for SpikeDetector {
    fn default() -> Self {
        Self::new(TrafficConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::record;
    use crate::models::AnomalyType;

    fn records_at(segment: (&str, &str), minutes: &[i64]) -> Vec<ApiRecord> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        minutes
            .iter()
            .map(|m| {
                let mut r = record(segment.0, segment.1, 200, 90.0);
                r.timestamp = base + chrono::Duration::minutes(*m);
                r
            })
            .collect()
    }

    fn baselines(mean: f64, std: f64) -> HashMap<Segment, TrafficBaseline> {
        HashMap::from([(Segment::new("user-service", "on-prem"), TrafficBaseline { mean, std })])
    }

    #[test]
    fn test_z_score_flags_above_threshold() {
        let detector = SpikeDetector::default();
        let spike = records_at(("user-service", "on-prem"), &[0; 20]);

        let anomalies = detector.detect(&spike, &baselines(10.0, 2.0));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::TrafficSpike);
        assert_eq!(anomalies[0].request_count(), Some(20));
        assert!((anomalies[0].anomaly_score - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_moderate_volume_not_flagged() {
        let detector = SpikeDetector::default();
        let normal = records_at(("user-service", "on-prem"), &[0; 14]);
        assert!(detector.detect(&normal, &baselines(10.0, 2.0)).is_empty());
        assert!((TrafficBaseline { mean: 10.0, std: 2.0 }.z_score(14) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_segment_without_baseline_skipped() {
        let detector = SpikeDetector::default();
        let spike = records_at(("payment-service", "aws-cloud"), &[0; 200]);
        assert!(detector.detect(&spike, &baselines(10.0, 2.0)).is_empty());
    }

    #[test]
    fn test_single_window_yields_no_baseline() {
        let records = records_at(("user-service", "on-prem"), &[0, 1, 2, 3]);
        assert!(TrafficBaseline::from_records(&records, Duration::from_secs(300)).is_none());
    }

    #[test]
    fn test_baseline_counts_empty_windows() {
        // windows: [2, 0, 4] -> mean 2, sample std 2
        let records = records_at(("user-service", "on-prem"), &[0, 1, 10, 11, 12, 13]);
        let baseline = TrafficBaseline::from_records(&records, Duration::from_secs(300)).unwrap();
        assert!((baseline.mean - 2.0).abs() < 1e-9);
        assert!((baseline.std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_variance_baseline() {
        let flat = TrafficBaseline { mean: 5.0, std: 0.0 };
        assert!(flat.z_score(6).is_infinite());
        assert_eq!(flat.z_score(5), 0.0);
        assert_eq!(flat.z_score(2), 0.0);
    }

    #[test]
    fn test_windows_are_epoch_aligned() {
        let records = records_at(("user-service", "on-prem"), &[0, 4, 5, 9]);
        let counts = bucket_counts(&records, Duration::from_secs(300));
        assert_eq!(counts.values().copied().collect::<Vec<_>>(), vec![2, 2]);
        let first = *counts.keys().next().unwrap();
        assert_eq!(first % 300, 0);
    }
}
