//! Monitor configuration

use anyhow::{bail, Result};
use monitor_lib::anomaly::{AlertConfig, TrafficConfig};
use monitor_lib::detector::DetectionConfig;
use monitor_lib::llm::GeminiConfig;
use monitor_lib::monitor::MonitorConfig;
use monitor_lib::source::SyntheticConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable prefix; nested keys use `__` (e.g. `MONITOR_GEMINI__MODEL`)
const ENV_PREFIX: &str = "MONITOR";

/// Key variable honoured when no key is configured
const GEMINI_KEY_VAR: &str = "GEMINI_API_KEY";

/// Monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name attached to structured log events
    pub instance: String,

    /// Port for health and metrics endpoints
    pub api_port: u16,

    /// Seconds between monitoring iterations
    pub interval_secs: u64,
    pub checkpoint_probability: f64,
    pub training_batch_size: usize,
    pub model_dir: PathBuf,
    pub data_dir: PathBuf,
    pub training_file: String,
    pub monitoring_file: String,
    pub force_retrain: bool,

    pub min_call_interval_secs: f64,
    pub quota_cooldown_secs: f64,
    pub alert_marker: String,

    pub bucket_secs: u64,
    pub z_threshold: f64,

    /// Live batch size bounds for the synthetic source
    pub batch_min: usize,
    pub batch_max: usize,
    pub anomaly_ratio: f64,
    pub training_anomaly_ratio: f64,
    pub seed: Option<u64>,

    pub detection: DetectionConfig,
    pub gemini: GeminiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        let alert = AlertConfig::default();
        let traffic = TrafficConfig::default();
        let synthetic = SyntheticConfig::default();

        Self {
            instance: std::env::var("HOSTNAME").unwrap_or_else(|_| "api-monitor".to_string()),
            api_port: 9100,
            interval_secs: monitor.interval.as_secs(),
            checkpoint_probability: monitor.checkpoint_probability,
            training_batch_size: monitor.training_batch_size,
            model_dir: monitor.model_dir,
            data_dir: monitor.data_dir,
            training_file: monitor.training_file,
            monitoring_file: monitor.monitoring_file,
            force_retrain: monitor.force_retrain,
            min_call_interval_secs: alert.min_call_interval.as_secs_f64(),
            quota_cooldown_secs: alert.quota_cooldown.as_secs_f64(),
            alert_marker: alert.alert_marker,
            bucket_secs: traffic.bucket.as_secs(),
            z_threshold: traffic.z_threshold,
            batch_min: *synthetic.batch_size.start(),
            batch_max: *synthetic.batch_size.end(),
            anomaly_ratio: synthetic.anomaly_ratio,
            training_anomaly_ratio: synthetic.training_anomaly_ratio,
            seed: synthetic.seed,
            detection: DetectionConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from defaults, an optional file, then `MONITOR_*` environment variables.
    ///
    /// Unreadable or invalid settings fall back to defaults with a warning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                bail!("Configuration file {:?} does not exist", path);
            }
        }

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>());
        let mut app_config = match loaded {
            Ok(app_config) => app_config,
            Err(e) => {
                warn!(error = %e, "Invalid configuration, using defaults");
                AppConfig::default()
            }
        };

        if app_config.gemini.api_key.is_none() {
            app_config.gemini.api_key =
                std::env::var(GEMINI_KEY_VAR).ok().filter(|k| !k.is_empty());
        }

        if let Err(e) = app_config.validate() {
            warn!(error = %e, "Invalid configuration, using defaults");
            let gemini = app_config.gemini;
            app_config = AppConfig {
                gemini,
                ..AppConfig::default()
            };
        }

        Ok(app_config)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_min == 0 || self.batch_min > self.batch_max {
            bail!("batch_min must be positive and at most batch_max");
        }
        if !(0.0..=1.0).contains(&self.checkpoint_probability) {
            bail!("checkpoint_probability must be within [0, 1]");
        }
        if self.bucket_secs == 0 {
            bail!("bucket_secs must be positive");
        }
        if !(self.detection.contamination > 0.0 && self.detection.contamination <= 0.5) {
            bail!("detection.contamination must be within (0, 0.5]");
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.interval_secs),
            checkpoint_probability: self.checkpoint_probability,
            training_batch_size: self.training_batch_size,
            model_dir: self.model_dir.clone(),
            data_dir: self.data_dir.clone(),
            training_file: self.training_file.clone(),
            monitoring_file: self.monitoring_file.clone(),
            force_retrain: self.force_retrain,
        }
    }

    pub fn alert_config(&self) -> AlertConfig {
        AlertConfig {
            min_call_interval: Duration::from_secs_f64(self.min_call_interval_secs.max(0.0)),
            quota_cooldown: Duration::from_secs_f64(self.quota_cooldown_secs.max(0.0)),
            alert_marker: self.alert_marker.clone(),
        }
    }

    pub fn traffic_config(&self) -> TrafficConfig {
        TrafficConfig {
            bucket: Duration::from_secs(self.bucket_secs),
            z_threshold: self.z_threshold,
        }
    }

    /// Live batches span one monitoring interval
    pub fn synthetic_config(&self) -> SyntheticConfig {
        SyntheticConfig {
            batch_size: self.batch_min..=self.batch_max,
            anomaly_ratio: self.anomaly_ratio,
            training_anomaly_ratio: self.training_anomaly_ratio,
            live_span: Duration::from_secs(self.interval_secs.max(1)),
            seed: self.seed,
            ..SyntheticConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.monitor_config().interval, Duration::from_secs(60));
        assert_eq!(config.alert_config().quota_cooldown, Duration::from_secs(60));
        assert_eq!(config.traffic_config().bucket, Duration::from_secs(300));
        assert_eq!(config.synthetic_config().batch_size, 50..=200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "interval_secs = 5\nbatch_max = 80\n[detection]\nlatency_threshold_ms = 250.0"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.batch_max, 80);
        assert_eq!(config.detection.latency_threshold_ms, 250.0);
        assert_eq!(config.detection.min_training_records, 1000);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "batch_min = 300\nbatch_max = 10").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.batch_min, 50);
        assert_eq!(config.batch_max, 200);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/monitor.toml"))).is_err());
    }
}
