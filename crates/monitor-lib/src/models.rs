//! Core data models for the API monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status codes at or above this value count as errors
pub const ERROR_STATUS_FLOOR: u16 = 400;

/// Status codes at or above this value count as server errors
pub const SERVER_ERROR_STATUS_FLOOR: u16 = 500;

/// A single API call as observed by the ingestion feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRecord {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub environment: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub user_id: String,
    pub endpoint: String,
    pub request_size: u64,
    pub response_size: u64,
    pub client_language: String,
}

impl ApiRecord {
    /// The (service, environment) pair this record belongs to
    pub fn segment(&self) -> Segment {
        Segment::new(self.service.clone(), self.environment.clone())
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= ERROR_STATUS_FLOOR
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code >= SERVER_ERROR_STATUS_FLOOR
    }
}

/// A (service, environment) pair; the unit of independent modeling
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
    pub service: String,
    pub environment: String,
}

impl Segment {
    pub fn new(service: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.service, self.environment)
    }
}

/// Feature vector fed to the outlier scorer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub response_time: f64,
    /// 1 if the status code is an error, 0 otherwise
    pub error_flag: u8,
}

impl FeatureVector {
    pub const DIMENSIONS: usize = 2;

    pub fn as_array(&self) -> [f64; Self::DIMENSIONS] {
        [self.response_time, f64::from(self.error_flag)]
    }
}

/// Anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    ServerError,
    HighLatency,
    ClientError,
    Behavioral,
    TrafficSpike,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::ServerError => "server_error",
            AnomalyType::HighLatency => "high_latency",
            AnomalyType::ClientError => "client_error",
            AnomalyType::Behavioral => "behavioral",
            AnomalyType::TrafficSpike => "traffic_spike",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered an anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyEvidence {
    /// A single request flagged by the segment's outlier scorer
    Request(ApiRecord),
    /// A time window whose request volume deviated from the segment baseline
    Traffic {
        request_count: u64,
        baseline_mean: f64,
        baseline_std: f64,
    },
}

/// A transient detection result; never persisted as authoritative state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub segment: Segment,
    pub timestamp: DateTime<Utc>,
    pub anomaly_type: AnomalyType,
    /// Scorer decision value for request anomalies, z-score for traffic spikes
    pub anomaly_score: f64,
    pub evidence: AnomalyEvidence,
}

impl Anomaly {
    pub fn from_record(record: ApiRecord, anomaly_type: AnomalyType, anomaly_score: f64) -> Self {
        Self {
            segment: record.segment(),
            timestamp: record.timestamp,
            anomaly_type,
            anomaly_score,
            evidence: AnomalyEvidence::Request(record),
        }
    }

    pub fn traffic_spike(
        segment: Segment,
        window_start: DateTime<Utc>,
        request_count: u64,
        z_score: f64,
        baseline_mean: f64,
        baseline_std: f64,
    ) -> Self {
        Self {
            segment,
            timestamp: window_start,
            anomaly_type: AnomalyType::TrafficSpike,
            anomaly_score: z_score,
            evidence: AnomalyEvidence::Traffic {
                request_count,
                baseline_mean,
                baseline_std,
            },
        }
    }

    pub fn service(&self) -> &str {
        &self.segment.service
    }

    pub fn environment(&self) -> &str {
        &self.segment.environment
    }

    pub fn record(&self) -> Option<&ApiRecord> {
        match &self.evidence {
            AnomalyEvidence::Request(record) => Some(record),
            AnomalyEvidence::Traffic { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.record().map(|r| r.status_code)
    }

    pub fn response_time_ms(&self) -> Option<f64> {
        self.record().map(|r| r.response_time_ms)
    }

    pub fn request_count(&self) -> Option<u64> {
        match &self.evidence {
            AnomalyEvidence::Traffic { request_count, .. } => Some(*request_count),
            AnomalyEvidence::Request(_) => None,
        }
    }
}
