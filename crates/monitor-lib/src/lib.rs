//! API traffic anomaly monitoring
//!
//! This crate provides the core functionality for:
//! - Per-segment outlier detection with isolation forests
//! - Traffic baselines and request-volume spike detection
//! - Model persistence
//! - Alert and report generation with local fallback
//! - The monitoring loop, health checks and observability

pub mod anomaly;
pub mod detector;
pub mod health;
pub mod llm;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod source;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{
    MonitorConfig, MonitorError, MonitorState, MonitoringSystem, MonitoringSystemBuilder,
};
pub use observability::{MonitorMetrics, StructuredLogger};
