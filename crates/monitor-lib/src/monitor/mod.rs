//! Monitoring orchestration
//!
//! Drives the monitoring lifecycle: load or train segment models, then
//! repeatedly fetch, persist, detect, alert and checkpoint until stopped.

mod r#loop;

pub use r#loop::{IterationSummary, MonitoringSystem, MonitoringSystemBuilder};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration for the monitoring loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Pause between iterations (default: 60 seconds)
    pub interval: Duration,
    /// Chance of saving models after an iteration
    pub checkpoint_probability: f64,
    /// Records requested from the source when training from scratch
    pub training_batch_size: usize,
    pub model_dir: PathBuf,
    pub data_dir: PathBuf,
    pub training_file: String,
    pub monitoring_file: String,
    /// Ignore persisted models and train from scratch
    pub force_retrain: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            checkpoint_probability: 0.1,
            training_batch_size: 5000,
            model_dir: PathBuf::from("models"),
            data_dir: PathBuf::from("data"),
            training_file: "training_data.jsonl".to_string(),
            monitoring_file: "monitoring_logs.jsonl".to_string(),
            force_retrain: false,
        }
    }
}

/// Lifecycle of a [`MonitoringSystem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Initializing,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Initializing => "initializing",
            MonitorState::Ready => "ready",
            MonitorState::Running => "running",
            MonitorState::ShuttingDown => "shutting_down",
            MonitorState::Stopped => "stopped",
            MonitorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Failures that end monitoring
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Model training failed on {records} records")]
    TrainingFailed { records: usize },

    #[error("Trained models could not be saved to {0:?}")]
    ModelSaveFailed(PathBuf),

    #[error("Record source failed: {0}")]
    Source(#[source] anyhow::Error),
}
