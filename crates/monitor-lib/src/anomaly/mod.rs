//! Traffic anomalies and alert generation
//!
//! This module provides:
//! - Traffic baselines and spike detection (z-score over request-count windows)
//! - Alert and report text generation with throttling and local fallback

mod alerter;
mod spike_detector;

pub use alerter::{
    fallback_alert, fallback_report, AlertConfig, AlertGenerator, AnomalyReport, LineSeverity,
    ReportStatistics, NO_ANOMALIES_MESSAGE,
};
pub use spike_detector::{bucket_counts, SpikeDetector, TrafficBaseline, TrafficConfig};
