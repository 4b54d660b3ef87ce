//! Training and detection across segments

use super::{DetectionConfig, FeatureExtractor, OutlierLabel, OutlierScorer, SegmentScorer};
use crate::anomaly::{TrafficBaseline, TrafficConfig};
use crate::models::{Anomaly, AnomalyType, ApiRecord, Segment, SERVER_ERROR_STATUS_FLOOR};
use crate::store::ModelStore;
use anyhow::Result;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Client language marking injected training anomalies
pub const SYNTHETIC_LANGUAGE: &str = "synthetic";

const SYNTHETIC_ENDPOINT: &str = "/api/synthetic";

/// Classify a flagged record; the order of checks is fixed
pub fn classify_anomaly(record: &ApiRecord, latency_threshold_ms: f64) -> AnomalyType {
    if record.status_code >= SERVER_ERROR_STATUS_FLOOR {
        AnomalyType::ServerError
    } else if record.response_time_ms > 2.0 * latency_threshold_ms {
        AnomalyType::HighLatency
    } else if record.is_error() {
        AnomalyType::ClientError
    } else {
        AnomalyType::Behavioral
    }
}

/// Detection result with per-segment coverage
#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    pub anomalies: Vec<Anomaly>,
    /// Segments run through their scorer
    pub scored_segments: Vec<Segment>,
    /// Segments with no trained model and their record counts
    pub unscored: Vec<(Segment, usize)>,
    /// Segments whose scoring failed
    pub failed_segments: Vec<Segment>,
    /// False when no model exists at all
    pub ready: bool,
}

impl DetectionReport {
    pub fn unscored_records(&self) -> usize {
        self.unscored.iter().map(|(_, count)| count).sum()
    }
}

fn group_by_segment<'a>(
    records: impl IntoIterator<Item = &'a ApiRecord>,
) -> BTreeMap<Segment, Vec<&'a ApiRecord>> {
    let mut groups: BTreeMap<Segment, Vec<&ApiRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.segment()).or_default().push(record);
    }
    groups
}

/// Per-segment outlier detection backed by a [`ModelStore`]
pub struct AnomalyDetector {
    config: DetectionConfig,
    traffic: TrafficConfig,
    extractor: FeatureExtractor,
    store: ModelStore,
}

impl AnomalyDetector {
    pub fn new(config: DetectionConfig, traffic: TrafficConfig, store: ModelStore) -> Self {
        Self {
            config,
            traffic,
            extractor: FeatureExtractor::new(),
            store,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn traffic_config(&self) -> &TrafficConfig {
        &self.traffic
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ModelStore {
        &mut self.store
    }

    pub fn is_ready(&self) -> bool {
        !self.store.is_empty()
    }

    /// Train one scorer and traffic baseline per segment.
    ///
    /// Existing models are replaced only for segments that trained
    /// successfully, and only after every segment has been attempted.
    pub fn train(&mut self, records: &[ApiRecord]) -> bool {
        if records.len() < self.config.min_training_records {
            warn!(
                records = records.len(),
                required = self.config.min_training_records,
                "Training corpus too small"
            );
            return false;
        }

        let error_records = records.iter().filter(|r| r.is_error()).count();
        let synthetic = if error_records < self.config.min_error_records {
            let injected = self.synthetic_anomalies(records);
            info!(
                error_records,
                injected = injected.len(),
                "Added synthetic anomalies to training corpus"
            );
            injected
        } else {
            Vec::new()
        };

        let groups = group_by_segment(records.iter().chain(synthetic.iter()));
        let segment_count = groups.len();

        let mut trained = Vec::new();
        for (segment, group) in groups {
            if group.len() < self.config.min_segment_records {
                warn!(
                    segment = %segment,
                    records = group.len(),
                    required = self.config.min_segment_records,
                    "Skipping segment with too few records"
                );
                continue;
            }

            let features = match self.extractor.extract_all(&group) {
                Ok(features) => features,
                Err(e) => {
                    warn!(
                        segment = %segment,
                        error = %e,
                        "Skipping segment with malformed records"
                    );
                    continue;
                }
            };

            let mut scorer = SegmentScorer::new(self.config.forest_params());
            if let Err(e) = scorer.fit(&features) {
                error!(segment = %segment, error = %e, "Failed to fit segment scorer");
                continue;
            }

            let baseline = TrafficBaseline::from_records(
                group.iter().copied().filter(|r| r.client_language != SYNTHETIC_LANGUAGE),
                self.traffic.bucket,
            );
            if baseline.is_none() {
                debug!(segment = %segment, "Not enough traffic windows for a baseline");
            }

            trained.push((segment, scorer, baseline));
        }

        if trained.is_empty() {
            warn!(segments = segment_count, "No segment could be trained");
            return false;
        }

        let trained_count = trained.len();
        for (segment, scorer, baseline) in trained {
            self.store.replace_segment(segment, scorer, baseline);
        }

        info!(
            trained = trained_count,
            segments = segment_count,
            records = records.len() + synthetic.len(),
            "Trained segment models"
        );
        true
    }

    /// Obviously anomalous records assigned to segments present in the corpus
    fn synthetic_anomalies(&self, records: &[ApiRecord]) -> Vec<ApiRecord> {
        let segments: Vec<Segment> = group_by_segment(records).into_keys().collect();
        if segments.is_empty() {
            return Vec::new();
        }
        let timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or_else(Utc::now);
        let mut rng = StdRng::seed_from_u64(self.config.random_seed);

        (0..self.config.synthetic_anomaly_count)
            .map(|_| {
                let segment = &segments[rng.gen_range(0..segments.len())];
                ApiRecord {
                    timestamp,
                    service: segment.service.clone(),
                    environment: segment.environment.clone(),
                    status_code: if rng.gen_bool(0.5) { 500 } else { 503 },
                    response_time_ms: rng.gen_range(5_000.0..10_000.0),
                    user_id: format!("user_{}", rng.gen_range(1..=1000)),
                    endpoint: SYNTHETIC_ENDPOINT.to_string(),
                    request_size: rng.gen_range(100..=5000),
                    response_size: rng.gen_range(50..=3000),
                    client_language: SYNTHETIC_LANGUAGE.to_string(),
                }
            })
            .collect()
    }

    /// Flagged records across all modelled segments
    pub fn detect(&self, records: &[ApiRecord]) -> Vec<Anomaly> {
        self.detect_with_coverage(records).anomalies
    }

    /// Flagged records plus which segments were scored, unscored or failed
    pub fn detect_with_coverage(&self, records: &[ApiRecord]) -> DetectionReport {
        let groups = group_by_segment(records);

        if self.store.is_empty() {
            warn!(records = records.len(), "No trained models available");
            return DetectionReport {
                unscored: groups.into_iter().map(|(s, g)| (s, g.len())).collect(),
                ready: false,
                ..Default::default()
            };
        }

        let mut report = DetectionReport {
            ready: true,
            ..Default::default()
        };

        for (segment, group) in groups {
            let Some(scorer) = self.store.model(&segment) else {
                report.unscored.push((segment, group.len()));
                continue;
            };

            match self.score_segment(scorer, &group) {
                Ok(found) => {
                    if !found.is_empty() {
                        info!(segment = %segment, anomalies = found.len(), "Found anomalies");
                    }
                    report.anomalies.extend(found);
                    report.scored_segments.push(segment);
                }
                Err(e) => {
                    error!(segment = %segment, error = %e, "Error detecting anomalies");
                    report.failed_segments.push(segment);
                }
            }
        }

        report
    }

    fn score_segment(&self, scorer: &SegmentScorer, group: &[&ApiRecord]) -> Result<Vec<Anomaly>> {
        let features = self.extractor.extract_all(group)?;

        let mut anomalies = Vec::new();
        for (record, feature) in group.iter().zip(&features) {
            let score = scorer.score(feature)?;
            if score.label == OutlierLabel::Outlier {
                let anomaly_type = classify_anomaly(record, self.config.latency_threshold_ms);
                anomalies.push(Anomaly::from_record((*record).clone(), anomaly_type, score.value));
            }
        }
        Ok(anomalies)
    }
}
