//! Observability infrastructure for the API monitor
//!
//! Provides:
//! - Prometheus metrics (iteration latency, detection latency, anomaly counts, alert fallbacks)
//! - Structured JSON logging with tracing

use crate::models::{Anomaly, AnomalyType};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for loop phases (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    iteration_latency_seconds: Histogram,
    detection_latency_seconds: Histogram,
    records_processed: IntCounter,
    anomalies_detected: IntCounterVec,
    unscored_records: IntCounter,
    alert_fallbacks: IntCounterVec,
    checkpoints: IntCounterVec,
    segments_modelled: IntGauge,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            iteration_latency_seconds: register_histogram!(
                "api_monitor_iteration_latency_seconds",
                "Time spent in one monitoring iteration, excluding the sleep",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register iteration_latency_seconds"),

            detection_latency_seconds: register_histogram!(
                "api_monitor_detection_latency_seconds",
                "Time spent scoring a batch and detecting traffic spikes",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register detection_latency_seconds"),

            records_processed: register_int_counter!(
                "api_monitor_records_processed_total",
                "Total number of API records run through detection"
            )
            .expect("Failed to register records_processed"),

            anomalies_detected: register_int_counter_vec!(
                "api_monitor_anomalies_detected_total",
                "Total number of anomalies detected by type",
                &["type"]
            )
            .expect("Failed to register anomalies_detected"),

            unscored_records: register_int_counter!(
                "api_monitor_unscored_records_total",
                "Records skipped because their segment has no trained model"
            )
            .expect("Failed to register unscored_records"),

            alert_fallbacks: register_int_counter_vec!(
                "api_monitor_alert_fallbacks_total",
                "Alert or report texts produced by local fallback, by reason",
                &["reason"]
            )
            .expect("Failed to register alert_fallbacks"),

            checkpoints: register_int_counter_vec!(
                "api_monitor_checkpoints_total",
                "Model store checkpoints by outcome",
                &["outcome"]
            )
            .expect("Failed to register checkpoints"),

            segments_modelled: register_int_gauge!(
                "api_monitor_segments_modelled",
                "Number of segments with a trained model"
            )
            .expect("Failed to register segments_modelled"),
        }
    }
}

/// Monitor metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new)
    }

    pub fn observe_iteration_latency(&self, duration_secs: f64) {
        self.inner().iteration_latency_seconds.observe(duration_secs);
    }

    pub fn observe_detection_latency(&self, duration_secs: f64) {
        self.inner().detection_latency_seconds.observe(duration_secs);
    }

    pub fn inc_records_processed(&self, count: u64) {
        self.inner().records_processed.inc_by(count);
    }

    pub fn inc_anomalies(&self, anomaly_type: AnomalyType) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[anomaly_type.as_str()])
            .inc();
    }

    pub fn inc_unscored_records(&self, count: u64) {
        self.inner().unscored_records.inc_by(count);
    }

    /// Count a fallback text; `reason` is one of disabled, quota, error, empty
    pub fn inc_alert_fallback(&self, reason: &str) {
        self.inner().alert_fallbacks.with_label_values(&[reason]).inc();
    }

    pub fn inc_checkpoint(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner().checkpoints.with_label_values(&[outcome]).inc();
    }

    pub fn set_segments_modelled(&self, count: i64) {
        self.inner().segments_modelled.set(count);
    }
}

/// Structured logger for monitor events
///
/// Provides consistent JSON-formatted logging for lifecycle
/// events and detected anomalies.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log monitor startup
    pub fn log_startup(&self, version: &str, segments: usize, retrained: bool) {
        info!(
            event = "monitor_started",
            instance = %self.instance,
            monitor_version = %version,
            segments = segments,
            retrained = retrained,
            "API monitor started"
        );
    }

    /// Log a completed training run
    pub fn log_models_trained(&self, records: usize, segments: usize) {
        info!(
            event = "models_trained",
            instance = %self.instance,
            records = records,
            segments = segments,
            "Segment models trained"
        );
    }

    /// Log an anomaly detection event
    pub fn log_anomaly(&self, anomaly: &Anomaly) {
        match anomaly.anomaly_type {
            AnomalyType::ServerError | AnomalyType::TrafficSpike => {
                warn!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    service = %anomaly.service(),
                    environment = %anomaly.environment(),
                    anomaly_type = %anomaly.anomaly_type,
                    anomaly_score = anomaly.anomaly_score,
                    status_code = ?anomaly.status_code(),
                    request_count = ?anomaly.request_count(),
                    "Anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    service = %anomaly.service(),
                    environment = %anomaly.environment(),
                    anomaly_type = %anomaly.anomaly_type,
                    anomaly_score = anomaly.anomaly_score,
                    status_code = ?anomaly.status_code(),
                    response_time_ms = ?anomaly.response_time_ms(),
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log a model store checkpoint
    pub fn log_checkpoint(&self, reason: &str, success: bool) {
        if success {
            info!(
                event = "models_checkpointed",
                instance = %self.instance,
                reason = %reason,
                "Model store checkpointed"
            );
        } else {
            warn!(
                event = "models_checkpointed",
                instance = %self.instance,
                reason = %reason,
                "Model store checkpoint incomplete"
            );
        }
    }

    /// Log monitor shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            instance = %self.instance,
            reason = %reason,
            "API monitor shutting down"
        );
    }
}
