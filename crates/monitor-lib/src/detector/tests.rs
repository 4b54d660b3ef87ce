//! Detector integration tests
//!
//! Run training and detection end to end over synthetic corpora.

#[cfg(test)]
mod training_detection_tests {
    use crate::anomaly::TrafficConfig;
    use crate::detector::{
        classify_anomaly, AnomalyDetector, DetectionConfig, OutlierScore, OutlierScorer,
    };
    use crate::models::FeatureVector;
    use crate::models::{AnomalyType, ApiRecord, Segment};
    use crate::source::{SyntheticConfig, SyntheticRecordSource};
    use crate::store::ModelStore;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn corpus(count: usize, anomaly_ratio: f64, seed: u64) -> Vec<ApiRecord> {
        let source = SyntheticRecordSource::new(SyntheticConfig {
            seed: Some(seed),
            ..Default::default()
        });
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        source.generate(count, anomaly_ratio, end, Duration::from_secs(3 * 3600), false)
    }

    fn detector(dir: &std::path::Path) -> AnomalyDetector {
        let store = ModelStore::new(dir).unwrap();
        AnomalyDetector::new(DetectionConfig::default(), TrafficConfig::default(), store)
    }

    fn record(
        service: &str,
        environment: &str,
        status_code: u16,
        response_time_ms: f64,
    ) -> ApiRecord {
        let mut r =
            crate::models::fixtures::record(service, environment, status_code, response_time_ms);
        r.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        r
    }

    #[test]
    fn test_training_flags_at_most_contamination() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());
        let records = corpus(4000, 0.1, 1);
        assert!(detector.train(&records));

        let anomalies = detector.detect(&records);
        let mut flagged: HashMap<Segment, usize> = HashMap::new();
        for anomaly in &anomalies {
            *flagged.entry(anomaly.segment.clone()).or_default() += 1;
        }

        let mut sizes: HashMap<Segment, usize> = HashMap::new();
        for r in &records {
            *sizes.entry(r.segment()).or_default() += 1;
        }

        for (segment, count) in flagged {
            let size = sizes[&segment];
            let allowed = (size as f64 * detector.config().contamination).ceil() as usize + 1;
            assert!(count <= allowed, "{} flagged {} of {}", segment, count, size);
        }
    }

    #[test]
    fn test_server_error_outranks_latency() {
        let config = DetectionConfig::default();
        let slow_failure = record(
            "payment-service",
            "aws-cloud",
            503,
            10.0 * config.latency_threshold_ms,
        );
        assert_eq!(
            classify_anomaly(&slow_failure, config.latency_threshold_ms),
            AnomalyType::ServerError
        );

        let slow = record("payment-service", "aws-cloud", 404, 1_200.0);
        assert_eq!(classify_anomaly(&slow, 500.0), AnomalyType::HighLatency);
        let not_found = record("payment-service", "aws-cloud", 404, 900.0);
        assert_eq!(classify_anomaly(&not_found, 500.0), AnomalyType::ClientError);
        let odd = record("payment-service", "aws-cloud", 200, 40.0);
        assert_eq!(classify_anomaly(&odd, 500.0), AnomalyType::Behavioral);
    }

    #[test]
    fn test_small_corpus_rejected_without_side_effects() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());
        assert!(detector.train(&corpus(2000, 0.1, 2)));

        let segments = detector.store().segments();
        let sample = FeatureVector {
            response_time: 3_000.0,
            error_flag: 1,
        };
        let before: Vec<OutlierScore> = segments
            .iter()
            .map(|s| detector.store().model(s).unwrap().score(&sample).unwrap())
            .collect();

        assert!(!detector.train(&corpus(999, 0.5, 3)));

        assert_eq!(detector.store().segments(), segments);
        let after: Vec<OutlierScore> = segments
            .iter()
            .map(|s| detector.store().model(s).unwrap().score(&sample).unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_save_load_detects_same_anomalies() {
        let temp_dir = TempDir::new().unwrap();
        let mut original = detector(temp_dir.path());
        assert!(original.train(&corpus(3000, 0.1, 4)));
        assert!(original.store().save());

        let mut restored = detector(temp_dir.path());
        assert!(restored.store_mut().load());

        let live = corpus(600, 0.2, 5);
        let expected = original.detect(&live);
        assert!(!expected.is_empty());
        assert_eq!(restored.detect(&live), expected);
    }

    #[test]
    fn test_extreme_request_flagged_and_classified() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());
        assert!(detector.train(&corpus(4000, 0.1, 6)));

        let batch = vec![
            record("user-service", "on-prem", 503, 9_000.0),
            record("user-service", "on-prem", 200, 80.0),
        ];
        let anomalies = detector.detect(&batch);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::ServerError);
        assert_eq!(anomalies[0].status_code(), Some(503));
        assert!(anomalies[0].anomaly_score < 0.0);
    }

    #[test]
    fn test_missing_models_reported_as_unscored() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());

        let not_ready =
            detector.detect_with_coverage(&[record("user-service", "on-prem", 200, 80.0)]);
        assert!(!not_ready.ready);
        assert!(not_ready.anomalies.is_empty());
        assert_eq!(not_ready.unscored_records(), 1);

        assert!(detector.train(&corpus(2000, 0.1, 7)));
        let batch = vec![
            record("user-service", "on-prem", 200, 80.0),
            record("billing-service", "on-prem", 200, 80.0),
            record("billing-service", "on-prem", 500, 8_000.0),
        ];
        let report = detector.detect_with_coverage(&batch);
        assert!(report.ready);
        assert_eq!(
            report.unscored,
            vec![(Segment::new("billing-service", "on-prem"), 2)]
        );
        assert_eq!(
            report.scored_segments,
            vec![Segment::new("user-service", "on-prem")]
        );
        assert!(report.anomalies.iter().all(|a| a.service() != "billing-service"));
    }

    #[test]
    fn test_scoring_failure_isolated_to_segment() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());
        assert!(detector.train(&corpus(2000, 0.1, 8)));

        let batch = vec![
            record("auth-service", "gcp-cloud", 200, f64::NAN),
            record("user-service", "on-prem", 503, 9_000.0),
        ];
        let report = detector.detect_with_coverage(&batch);
        assert_eq!(
            report.failed_segments,
            vec![Segment::new("auth-service", "gcp-cloud")]
        );
        assert_eq!(
            report.scored_segments,
            vec![Segment::new("user-service", "on-prem")]
        );
    }

    #[test]
    fn test_hung_request_scored_with_its_segment() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());
        assert!(detector.train(&corpus(4000, 0.1, 6)));

        let batch = vec![
            record("user-service", "on-prem", 504, 4_000_000.0),
            record("user-service", "on-prem", 503, 9_000.0),
        ];
        let report = detector.detect_with_coverage(&batch);
        assert!(report.failed_segments.is_empty());
        assert_eq!(
            report.scored_segments,
            vec![Segment::new("user-service", "on-prem")]
        );

        let mut codes: Vec<Option<u16>> =
            report.anomalies.iter().map(|a| a.status_code()).collect();
        codes.sort();
        assert_eq!(codes, vec![Some(503), Some(504)]);
        assert!(report
            .anomalies
            .iter()
            .all(|a| a.anomaly_type == AnomalyType::ServerError));
    }

    #[test]
    fn test_training_keeps_segment_with_hung_request() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());

        let mut records = corpus(3000, 0.1, 10);
        records.push(record("user-service", "on-prem", 504, 4_000_000.0));
        assert!(detector.train(&records));
        assert!(detector
            .store()
            .model(&Segment::new("user-service", "on-prem"))
            .is_some());
    }

    #[test]
    fn test_synthetic_injection_when_errors_scarce() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());

        // Two segments, no errors at all
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let records: Vec<ApiRecord> = (0..1200)
            .map(|i| {
                let environment = if i % 2 == 0 { "on-prem" } else { "aws-cloud" };
                let latency = 90.0 + (i % 30) as f64;
                let mut r = record("inventory-service", environment, 200, latency);
                r.timestamp = start + chrono::Duration::seconds(i as i64 * 9);
                r
            })
            .collect();

        assert!(detector.train(&records));
        assert_eq!(
            detector.store().segments(),
            vec![
                Segment::new("inventory-service", "aws-cloud"),
                Segment::new("inventory-service", "on-prem"),
            ]
        );

        // 600 organic records over 36 windows; injected ones are not counted
        let baseline = detector
            .store()
            .baseline(&Segment::new("inventory-service", "on-prem"))
            .copied()
            .unwrap();
        assert!((baseline.mean - 600.0 / 36.0).abs() < 1e-9);

        let failure = record("inventory-service", "on-prem", 503, 20_000.0);
        let anomalies = detector.detect(&[failure]);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::ServerError);
    }

    #[test]
    fn test_small_segments_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let mut detector = detector(temp_dir.path());

        let mut records = corpus(1500, 0.1, 9);
        records.retain(|r| r.service != "auth-service" || r.environment != "azure-cloud");
        records.extend((0..30).map(|_| record("auth-service", "azure-cloud", 200, 150.0)));

        assert!(detector.train(&records));
        assert!(detector
            .store()
            .model(&Segment::new("auth-service", "azure-cloud"))
            .is_none());
        assert!(detector.store().model_count() >= 10);
    }
}
