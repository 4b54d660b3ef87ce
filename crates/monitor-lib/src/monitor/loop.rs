//! Monitoring loop
//!
//! Runs the sequential fetch, persist, detect, alert, checkpoint cycle with a
//! fixed pause between iterations until a shutdown signal arrives.

use super::{MonitorConfig, MonitorError, MonitorState};
use crate::anomaly::{AlertConfig, AlertGenerator, LineSeverity, SpikeDetector, TrafficConfig};
use crate::detector::{AnomalyDetector, DetectionConfig};
use crate::health::{components, HealthRegistry};
use crate::llm::TextGenerator;
use crate::models::{Anomaly, ApiRecord};
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::source::RecordSource;
use crate::store::{JsonlRecordStore, ModelStore, RecordStore};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What one loop iteration did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationSummary {
    pub records: usize,
    pub anomalies: usize,
    pub traffic_spikes: usize,
    pub unscored_records: usize,
    pub failed_segments: usize,
    /// Outcome of the checkpoint, if one was attempted
    pub checkpointed: Option<bool>,
}

/// Owns every monitoring component and drives them in sequence
pub struct MonitoringSystem {
    config: MonitorConfig,
    source: Arc<dyn RecordSource>,
    record_store: Arc<dyn RecordStore>,
    detector: AnomalyDetector,
    spike_detector: SpikeDetector,
    alerter: AlertGenerator,
    health: HealthRegistry,
    metrics: MonitorMetrics,
    logger: StructuredLogger,
    state: MonitorState,
    rng: StdRng,
}

impl MonitoringSystem {
    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Load persisted models, or train and persist new ones.
    ///
    /// Failing to train, or to save freshly trained models, is fatal.
    pub async fn initialize(&mut self) -> Result<(), MonitorError> {
        self.state = MonitorState::Initializing;
        self.health.register_all().await;

        let loaded = if self.config.force_retrain {
            info!("Forced retrain requested, ignoring persisted models");
            false
        } else {
            self.detector.store_mut().load()
        };

        if loaded {
            info!(
                segments = self.detector.store().model_count(),
                dir = %self.detector.store().dir().display(),
                "Loaded persisted segment models"
            );
        } else {
            self.train_from_source().await?;
        }

        let segments = self.detector.store().model_count();
        self.metrics.set_segments_modelled(segments as i64);
        self.health.set_healthy(components::DETECTOR).await;
        self.health.set_healthy(components::MODEL_STORE).await;
        self.health.set_ready(true).await;
        self.state = MonitorState::Ready;

        self.logger.log_startup(env!("CARGO_PKG_VERSION"), segments, !loaded);
        Ok(())
    }

    async fn train_from_source(&mut self) -> Result<(), MonitorError> {
        info!(records = self.config.training_batch_size, "Generating training corpus");
        let records = match self.source.fetch_history(self.config.training_batch_size).await {
            Ok(records) => records,
            Err(e) => {
                self.health.set_unhealthy(components::RECORD_SOURCE, e.to_string()).await;
                return Err(self.fail(MonitorError::Source(e)));
            }
        };

        self.persist(&records, &self.config.training_file).await;

        if !self.detector.train(&records) {
            self.health.set_unhealthy(components::DETECTOR, "Training failed").await;
            return Err(self.fail(MonitorError::TrainingFailed { records: records.len() }));
        }
        self.logger.log_models_trained(records.len(), self.detector.store().model_count());

        if !self.detector.store().save() {
            self.health
                .set_unhealthy(components::MODEL_STORE, "Saving trained models failed")
                .await;
            let dir = self.detector.store().dir().to_path_buf();
            return Err(self.fail(MonitorError::ModelSaveFailed(dir)));
        }
        Ok(())
    }

    fn fail(&mut self, error: MonitorError) -> MonitorError {
        error!(error = %error, state = %self.state, "Monitoring failed");
        self.state = MonitorState::Failed;
        error
    }

    /// Append records to the data directory; failures only degrade health
    async fn persist(&self, records: &[ApiRecord], file_name: &str) {
        if records.is_empty() {
            return;
        }
        match self.record_store.append(records, file_name) {
            Ok(path) => debug!(
                records = records.len(),
                path = %path.display(),
                "Persisted records"
            ),
            Err(e) => {
                warn!(file = file_name, error = %e, "Failed to persist records");
                self.health.set_degraded(components::RECORD_STORE, e.to_string()).await;
            }
        }
    }

    /// Run one fetch, persist, detect, alert, checkpoint cycle
    pub async fn run_iteration(&mut self) -> Result<IterationSummary, MonitorError> {
        let start = Instant::now();

        let records = match self.source.fetch_batch().await {
            Ok(records) => records,
            Err(e) => {
                self.health.set_unhealthy(components::RECORD_SOURCE, e.to_string()).await;
                return Err(MonitorError::Source(e));
            }
        };

        let mut summary = IterationSummary {
            records: records.len(),
            ..Default::default()
        };

        if records.is_empty() {
            debug!("No new records");
        } else {
            self.persist(&records, &self.config.monitoring_file).await;

            let anomalies = self.detect(&records, &mut summary).await;
            if !anomalies.is_empty() {
                self.alert(&anomalies).await;
            }
            self.metrics.inc_records_processed(records.len() as u64);
        }

        if self.rng.gen::<f64>() < self.config.checkpoint_probability {
            summary.checkpointed = Some(self.checkpoint("periodic").await);
        }

        self.metrics.observe_iteration_latency(start.elapsed().as_secs_f64());
        Ok(summary)
    }

    async fn detect(&self, records: &[ApiRecord], summary: &mut IterationSummary) -> Vec<Anomaly> {
        let start = Instant::now();

        let coverage = self.detector.detect_with_coverage(records);
        let spikes = self.spike_detector.detect(records, self.detector.store().baselines());
        self.metrics.observe_detection_latency(start.elapsed().as_secs_f64());

        summary.unscored_records = coverage.unscored_records();
        summary.failed_segments = coverage.failed_segments.len();
        summary.traffic_spikes = spikes.len();

        if summary.unscored_records > 0 {
            let segments: Vec<String> =
                coverage.unscored.iter().map(|(s, _)| s.to_string()).collect();
            warn!(
                records = summary.unscored_records,
                segments = ?segments,
                "Records left unscored, no model for their segment"
            );
            self.metrics.inc_unscored_records(summary.unscored_records as u64);
        }

        if coverage.failed_segments.is_empty() {
            self.health.set_healthy(components::DETECTOR).await;
        } else {
            let failed: Vec<String> =
                coverage.failed_segments.iter().map(|s| s.to_string()).collect();
            self.health
                .set_degraded(
                    components::DETECTOR,
                    format!("Scoring failed for {}", failed.join(", ")),
                )
                .await;
        }

        let mut anomalies = coverage.anomalies;
        anomalies.extend(spikes);
        summary.anomalies = anomalies.len();

        for anomaly in &anomalies {
            self.logger.log_anomaly(anomaly);
            self.metrics.inc_anomalies(anomaly.anomaly_type);
        }
        anomalies
    }

    async fn alert(&self, anomalies: &[Anomaly]) {
        let report = self.alerter.generate_anomaly_report(anomalies).await;
        info!(
            anomalies = anomalies.len(),
            statistics = ?report.statistics,
            "Anomaly report"
        );
        for line in report.analysis.lines().filter(|l| !l.trim().is_empty()) {
            info!(report = true, "{}", line);
        }

        for anomaly in anomalies {
            let message = self.alerter.generate_alert_message(anomaly).await;
            for line in message.lines().filter(|l| !l.trim().is_empty()) {
                match self.alerter.line_severity(line) {
                    LineSeverity::Warning => warn!(segment = %anomaly.segment, "{}", line),
                    LineSeverity::Info => info!(segment = %anomaly.segment, "{}", line),
                }
            }
        }
    }

    /// Save models and baselines; returns whether every item was written
    pub async fn checkpoint(&self, reason: &str) -> bool {
        let success = self.detector.store().save();
        self.metrics.inc_checkpoint(success);
        self.logger.log_checkpoint(reason, success);

        if success {
            self.health.set_healthy(components::MODEL_STORE).await;
        } else {
            self.health
                .set_degraded(components::MODEL_STORE, "Checkpoint incomplete")
                .await;
        }
        success
    }

    /// Run until `shutdown` fires or an iteration fails.
    ///
    /// Initializes first if needed. Both exits attempt a checkpoint.
    pub async fn run(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), MonitorError> {
        if self.state != MonitorState::Ready {
            self.initialize().await?;
        }

        self.state = MonitorState::Running;
        info!(
            interval_secs = self.config.interval.as_secs(),
            segments = self.detector.store().model_count(),
            "Starting monitoring loop"
        );

        let mut iterations = 0u64;
        loop {
            tokio::select! {
                result = self.run_iteration() => {
                    match result {
                        Ok(summary) => {
                            iterations += 1;
                            debug!(
                                iteration = iterations,
                                records = summary.records,
                                anomalies = summary.anomalies,
                                "Monitoring iteration complete"
                            );
                        }
                        Err(e) => {
                            self.checkpoint("failure").await;
                            self.health.set_ready(false).await;
                            return Err(self.fail(e));
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        self.shutdown("interrupted").await;
        Ok(())
    }

    /// Initialize if needed, run a single iteration, then shut down.
    ///
    /// Returns `None` when `shutdown` fires first; an interrupt received
    /// during startup is honoured before the iteration begins.
    pub async fn run_once(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Option<IterationSummary>, MonitorError> {
        if self.state != MonitorState::Ready {
            self.initialize().await?;
        }

        self.state = MonitorState::Running;
        let outcome = tokio::select! {
            biased;
            _ = shutdown.recv() => None,
            result = self.run_iteration() => Some(result),
        };

        match outcome {
            Some(Ok(summary)) => {
                self.shutdown("single iteration complete").await;
                Ok(Some(summary))
            }
            Some(Err(e)) => {
                self.checkpoint("failure").await;
                self.health.set_ready(false).await;
                Err(self.fail(e))
            }
            None => {
                self.shutdown("interrupted").await;
                Ok(None)
            }
        }
    }

    async fn shutdown(&mut self, reason: &str) {
        self.state = MonitorState::ShuttingDown;
        self.logger.log_shutdown(reason);
        self.health.set_ready(false).await;
        self.checkpoint("shutdown").await;
        self.state = MonitorState::Stopped;
    }
}

/// Builder for assembling a [`MonitoringSystem`]
pub struct MonitoringSystemBuilder {
    config: MonitorConfig,
    detection: DetectionConfig,
    traffic: TrafficConfig,
    alert: AlertConfig,
    source: Option<Arc<dyn RecordSource>>,
    record_store: Option<Arc<dyn RecordStore>>,
    generator: Option<Arc<dyn TextGenerator>>,
    health: Option<HealthRegistry>,
    instance: String,
    seed: Option<u64>,
}

impl MonitoringSystemBuilder {
    pub fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
            detection: DetectionConfig::default(),
            traffic: TrafficConfig::default(),
            alert: AlertConfig::default(),
            source: None,
            record_store: None,
            generator: None,
            health: None,
            instance: "api-monitor".to_string(),
            seed: None,
        }
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn detection(mut self, detection: DetectionConfig) -> Self {
        self.detection = detection;
        self
    }

    pub fn traffic(mut self, traffic: TrafficConfig) -> Self {
        self.traffic = traffic;
        self
    }

    pub fn alert(mut self, alert: AlertConfig) -> Self {
        self.alert = alert;
        self
    }

    /// Set the record source (required)
    pub fn source(mut self, source: Arc<dyn RecordSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Override the JSON Lines store under `data_dir`
    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(store);
        self
    }

    /// Set the text service; without one alerts use fallback text only
    pub fn generator(mut self, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        self.generator = generator;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Seed the checkpoint draw for reproducible runs
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<MonitoringSystem> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Record source is required"))?;

        if !(0.0..=1.0).contains(&self.config.checkpoint_probability) {
            anyhow::bail!(
                "Checkpoint probability must be within [0, 1], got {}",
                self.config.checkpoint_probability
            );
        }

        let record_store = match self.record_store {
            Some(store) => store,
            None => Arc::new(JsonlRecordStore::new(&self.config.data_dir)?),
        };
        let model_store = ModelStore::new(&self.config.model_dir)?;
        let spike_detector = SpikeDetector::new(self.traffic.clone());
        let detector = AnomalyDetector::new(self.detection, self.traffic, model_store);

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(MonitoringSystem {
            config: self.config,
            source,
            record_store,
            detector,
            spike_detector,
            alerter: AlertGenerator::new(self.alert, self.generator),
            health: self.health.unwrap_or_default(),
            metrics: MonitorMetrics::new(),
            logger: StructuredLogger::new(self.instance),
            state: MonitorState::Initializing,
            rng,
        })
    }
}

impl Default for MonitoringSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
