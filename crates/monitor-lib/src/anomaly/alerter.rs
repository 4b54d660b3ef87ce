//! Alert and report generation
//!
//! Handles:
//! - Text generation through an external [`TextGenerator`]
//! - Throttling successive external calls to a minimum interval
//! - Cooldown after quota exhaustion
//! - Deterministic local fallback text when the service is absent or failing

use crate::llm::{GenerationOutcome, TextGenerator};
use crate::models::{Anomaly, AnomalyEvidence, AnomalyType};
use crate::observability::MonitorMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Analysis text for an empty batch
pub const NO_ANOMALIES_MESSAGE: &str = "No anomalies detected";

/// Configuration for the alert generator
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Minimum time between external calls
    pub min_call_interval: Duration,
    /// Wait applied after a quota failure before falling back
    pub quota_cooldown: Duration,
    /// Prefix that opens every alert summary line
    pub alert_marker: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            min_call_interval: Duration::from_secs(2),
            quota_cooldown: Duration::from_secs(60),
            alert_marker: "ALERT:".to_string(),
        }
    }
}

/// Log severity for one line of generated text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSeverity {
    Warning,
    Info,
}

/// Aggregate counts over a batch of anomalies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportStatistics {
    pub total: usize,
    pub services: BTreeMap<String, usize>,
    pub types: BTreeMap<String, usize>,
    pub environments: BTreeMap<String, usize>,
}

impl ReportStatistics {
    pub fn from_anomalies(anomalies: &[Anomaly]) -> Self {
        let mut services = BTreeMap::new();
        let mut types = BTreeMap::new();
        let mut environments = BTreeMap::new();
        for anomaly in anomalies {
            *services.entry(anomaly.service().to_string()).or_insert(0) += 1;
            *types.entry(anomaly.anomaly_type.as_str().to_string()).or_insert(0) += 1;
            *environments.entry(anomaly.environment().to_string()).or_insert(0) += 1;
        }
        Self {
            total: anomalies.len(),
            services,
            types,
            environments,
        }
    }

    pub fn most_affected_service(&self) -> Option<&str> {
        most_common(&self.services)
    }

    pub fn most_common_type(&self) -> Option<&str> {
        most_common(&self.types)
    }
}

/// Highest count; ties go to the first key in order
fn most_common(counts: &BTreeMap<String, usize>) -> Option<&str> {
    counts
        .iter()
        .fold(None, |best: Option<(&String, usize)>, (key, count)| match best {
            Some((_, best_count)) if best_count >= *count => best,
            _ => Some((key, *count)),
        })
        .map(|(key, _)| key.as_str())
}

/// Batch report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// Absent only for an empty batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ReportStatistics>,
    pub analysis: String,
}

impl AnomalyReport {
    pub fn empty() -> Self {
        Self {
            statistics: None,
            analysis: NO_ANOMALIES_MESSAGE.to_string(),
        }
    }
}

/// Turns anomalies into alert and report text
pub struct AlertGenerator {
    config: AlertConfig,
    generator: Option<Arc<dyn TextGenerator>>,
    last_call: Mutex<Option<Instant>>,
    metrics: MonitorMetrics,
}

impl AlertGenerator {
    /// Create a generator; `None` runs in fallback-only mode
    pub fn new(config: AlertConfig, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self {
            config,
            generator,
            last_call: Mutex::new(None),
            metrics: MonitorMetrics::new(),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Alert text for one anomaly; always non-empty
    pub async fn generate_alert_message(&self, anomaly: &Anomaly) -> String {
        let prompt = alert_prompt(anomaly, &self.config.alert_marker);
        match self.request(&prompt, "alert").await {
            Some(text) => text,
            None => fallback_alert(anomaly, &self.config.alert_marker),
        }
    }

    /// Report for a batch; an empty batch short-circuits without any external call
    pub async fn generate_anomaly_report(&self, anomalies: &[Anomaly]) -> AnomalyReport {
        if anomalies.is_empty() {
            return AnomalyReport::empty();
        }

        let statistics = ReportStatistics::from_anomalies(anomalies);
        let analysis = match self.request(&report_prompt(&statistics), "report").await {
            Some(text) => text,
            None => fallback_report(&statistics),
        };

        AnomalyReport {
            statistics: Some(statistics),
            analysis,
        }
    }

    /// Severity for one line of generated text
    pub fn line_severity(&self, line: &str) -> LineSeverity {
        if line.trim_start().starts_with(&self.config.alert_marker) {
            LineSeverity::Warning
        } else {
            LineSeverity::Info
        }
    }

    /// External call with throttling and failure handling; `None` means use the fallback
    async fn request(&self, prompt: &str, kind: &str) -> Option<String> {
        let Some(generator) = &self.generator else {
            self.metrics.inc_alert_fallback("disabled");
            return None;
        };

        self.enforce_rate_limit().await;

        match generator.generate(prompt).await {
            GenerationOutcome::Generated(text) if !text.trim().is_empty() => Some(text),
            GenerationOutcome::Generated(_) => {
                warn!(
                    generator = %generator.name(),
                    kind,
                    "Text service returned empty text, using fallback"
                );
                self.metrics.inc_alert_fallback("empty");
                None
            }
            GenerationOutcome::QuotaExceeded(reason) => {
                error!(
                    generator = %generator.name(),
                    kind,
                    reason = %reason,
                    cooldown_secs = self.config.quota_cooldown.as_secs_f64(),
                    "Text service quota exceeded, cooling down"
                );
                tokio::time::sleep(self.config.quota_cooldown).await;
                self.metrics.inc_alert_fallback("quota");
                None
            }
            GenerationOutcome::Failed(reason) => {
                error!(
                    generator = %generator.name(),
                    kind,
                    reason = %reason,
                    "Text generation failed, using fallback"
                );
                self.metrics.inc_alert_fallback("error");
                None
            }
        }
    }

    /// Block until the minimum interval since the previous call has elapsed
    async fn enforce_rate_limit(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_call_interval {
                let wait = self.config.min_call_interval - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "Throttling text service call");
                tokio::time::sleep(wait).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

fn alert_prompt(anomaly: &Anomaly, marker: &str) -> String {
    let details = match &anomaly.evidence {
        AnomalyEvidence::Request(record) => format!(
            "Status Code: {}\nResponse Time: {:.2}ms\nEndpoint: {}",
            record.status_code, record.response_time_ms, record.endpoint
        ),
        AnomalyEvidence::Traffic {
            request_count,
            baseline_mean,
            baseline_std,
        } => format!(
            "Requests in window: {}\nBaseline: {:.1} +/- {:.1} per window\nZ-score: {:.2}",
            request_count, baseline_mean, baseline_std, anomaly.anomaly_score
        ),
    };

    format!(
        "Create a concise alert message for this API anomaly:\n\
         Service: {}\nEnvironment: {}\nType: {}\n{}\nTimestamp: {}\n\n\
         Provide:\n\
         1. One-line summary (start with '{}')\n\
         2. Probable cause (most likely technical reason)\n\
         3. Recommended action (concrete technical steps)",
        anomaly.service(),
        anomaly.environment(),
        anomaly.anomaly_type,
        details,
        anomaly.timestamp.to_rfc3339(),
        marker
    )
}

fn report_prompt(statistics: &ReportStatistics) -> String {
    format!(
        "Analyze these API anomalies (technical analysis for engineers):\n\
         Total: {}\nServices affected: {:?}\nEnvironments affected: {:?}\nAnomaly types: {:?}\n\n\
         Provide:\n\
         1. Root cause analysis (technical hypotheses)\n\
         2. Impact assessment (technical consequences)\n\
         3. Recommendations (actionable engineering steps)\n\
         Format with clear section headings.",
        statistics.total, statistics.services, statistics.environments, statistics.types
    )
}

fn probable_cause(anomaly_type: AnomalyType) -> &'static str {
    match anomaly_type {
        AnomalyType::ServerError => "service failure or an unavailable downstream dependency",
        AnomalyType::HighLatency => "resource saturation or a slow downstream dependency",
        AnomalyType::ClientError => "malformed requests or an incompatible client release",
        AnomalyType::Behavioral => "request pattern that deviates from the learned profile",
        AnomalyType::TrafficSpike => "sudden surge in request volume",
    }
}

fn recommended_action(anomaly_type: AnomalyType) -> &'static str {
    match anomaly_type {
        AnomalyType::ServerError => {
            "check service logs and health of dependencies, roll back recent deploys if needed"
        }
        AnomalyType::HighLatency => {
            "inspect CPU, memory and connection pools and check slow queries"
        }
        AnomalyType::ClientError => "review recent API contract changes and client versions",
        AnomalyType::Behavioral => {
            "review the request against normal usage for this user and endpoint"
        }
        AnomalyType::TrafficSpike => "verify the traffic source, apply rate limiting or scale out",
    }
}

/// Templated alert built only from fields already on the anomaly
pub fn fallback_alert(anomaly: &Anomaly, marker: &str) -> String {
    let mut text = format!(
        "{} {} in {} ({})\n",
        marker,
        anomaly.anomaly_type,
        anomaly.service(),
        anomaly.environment()
    );

    match &anomaly.evidence {
        AnomalyEvidence::Request(record) => {
            text.push_str(&format!(
                "Status: {}\nResponse Time: {:.2}ms\n",
                record.status_code, record.response_time_ms
            ));
        }
        AnomalyEvidence::Traffic {
            request_count,
            baseline_mean,
            ..
        } => {
            text.push_str(&format!(
                "Requests: {} (baseline {:.1}, z-score {:.2})\n",
                request_count, baseline_mean, anomaly.anomaly_score
            ));
        }
    }

    text.push_str(&format!(
        "Timestamp: {}\nProbable Cause: {}\nRecommended Action: {}",
        anomaly.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        probable_cause(anomaly.anomaly_type),
        recommended_action(anomaly.anomaly_type)
    ));
    text
}

/// Templated report analysis from batch statistics
pub fn fallback_report(statistics: &ReportStatistics) -> String {
    if statistics.total == 0 {
        return NO_ANOMALIES_MESSAGE.to_string();
    }
    format!(
        "Detected {} anomalies across services. Most affected: {}. Most common type: {}.",
        statistics.total,
        statistics.most_affected_service().unwrap_or("unknown"),
        statistics.most_common_type().unwrap_or("unknown")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::record;
    use crate::models::Segment;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
        reply: String,
    }

    #[async_trait]
    impl TextGenerator for CountingGenerator {
        fn name(&self) -> &str {
            "counting"
        }

        async fn generate(&self, _prompt: &str) -> GenerationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            GenerationOutcome::Generated(self.reply.clone())
        }
    }

    /// Follows the prompt's instruction for the summary line
    #[derive(Debug)]
    struct InstructionFollowingGenerator;

    #[async_trait]
    impl TextGenerator for InstructionFollowingGenerator {
        fn name(&self) -> &str {
            "instruction-following"
        }

        async fn generate(&self, prompt: &str) -> GenerationOutcome {
            let marker = prompt
                .split("(start with '")
                .nth(1)
                .and_then(|rest| rest.split('\'').next())
                .unwrap_or("");
            GenerationOutcome::Generated(format!(
                "{} payment-service failing\nProbable cause: dependency outage",
                marker
            ))
        }
    }

    #[derive(Debug)]
    struct QuotaGenerator;

    #[async_trait]
    impl TextGenerator for QuotaGenerator {
        fn name(&self) -> &str {
            "quota"
        }

        async fn generate(&self, _prompt: &str) -> GenerationOutcome {
            GenerationOutcome::QuotaExceeded("429 Resource has been exhausted".to_string())
        }
    }

    #[derive(Debug)]
    struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate(&self, _prompt: &str) -> GenerationOutcome {
            GenerationOutcome::Failed("connection refused".to_string())
        }
    }

    fn fast_config() -> AlertConfig {
        AlertConfig {
            min_call_interval: Duration::from_millis(0),
            quota_cooldown: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn server_error() -> Anomaly {
        Anomaly::from_record(
            record("payment-service", "aws-cloud", 503, 5_400.0),
            AnomalyType::ServerError,
            -0.21,
        )
    }

    #[tokio::test]
    async fn test_quota_failure_falls_back() {
        let alerter = AlertGenerator::new(fast_config(), Some(Arc::new(QuotaGenerator)));

        let text = alerter.generate_alert_message(&server_error()).await;
        assert!(text.starts_with("ALERT:"));
        assert!(text.contains("payment-service"));
        assert!(text.contains("503"));

        let report = alerter.generate_anomaly_report(&[server_error()]).await;
        assert_eq!(
            report.analysis,
            concat!(
                "Detected 1 anomalies across services. ",
                "Most affected: payment-service. Most common type: server_error."
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_cooldown_is_applied() {
        let config = AlertConfig {
            quota_cooldown: Duration::from_secs(60),
            ..fast_config()
        };
        let alerter = AlertGenerator::new(config, Some(Arc::new(QuotaGenerator)));

        let start = Instant::now();
        alerter.generate_alert_message(&server_error()).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_other_failure_falls_back_without_cooldown() {
        let config = AlertConfig {
            quota_cooldown: Duration::from_secs(3600),
            ..fast_config()
        };
        let alerter = AlertGenerator::new(config, Some(Arc::new(FailingGenerator)));
        let anomaly = server_error();
        let text = tokio::time::timeout(
            Duration::from_secs(5),
            alerter.generate_alert_message(&anomaly),
        )
        .await
        .unwrap();
        assert!(text.contains("Status: 503"));
    }

    #[tokio::test]
    async fn test_empty_report_makes_no_call() {
        let generator = Arc::new(CountingGenerator {
            reply: "analysis".to_string(),
            ..Default::default()
        });
        let alerter = AlertGenerator::new(fast_config(), Some(generator.clone()));

        let report = alerter.generate_anomaly_report(&[]).await;
        assert_eq!(report, AnomalyReport::empty());
        assert_eq!(report.analysis, "No anomalies detected");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generated_text_is_used() {
        let generator = Arc::new(CountingGenerator {
            reply: "ALERT: payment-service failing\nProbable cause: db".to_string(),
            ..Default::default()
        });
        let alerter = AlertGenerator::new(fast_config(), Some(generator.clone()));

        let text = alerter.generate_alert_message(&server_error()).await;
        assert_eq!(text, "ALERT: payment-service failing\nProbable cause: db");
        let report = alerter.generate_anomaly_report(&[server_error()]).await;
        assert_eq!(report.statistics.unwrap().total, 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_generated_text_falls_back() {
        let generator = Arc::new(CountingGenerator::default());
        let alerter = AlertGenerator::new(fast_config(), Some(generator));
        let text = alerter.generate_alert_message(&server_error()).await;
        assert!(text.starts_with("ALERT: server_error in payment-service (aws-cloud)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_spaced() {
        let generator = Arc::new(CountingGenerator {
            reply: "ok".to_string(),
            ..Default::default()
        });
        let config = AlertConfig {
            min_call_interval: Duration::from_secs(2),
            ..fast_config()
        };
        let alerter = AlertGenerator::new(config, Some(generator.clone()));

        let start = Instant::now();
        for _ in 0..3 {
            alerter.generate_alert_message(&server_error()).await;
        }
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fallback_only_mode() {
        let alerter = AlertGenerator::new(fast_config(), None);
        assert!(!alerter.has_generator());
        let spike = Anomaly::traffic_spike(
            Segment::new("auth-service", "gcp-cloud"),
            server_error().timestamp,
            42,
            7.5,
            9.0,
            4.4,
        );
        let text = alerter.generate_alert_message(&spike).await;
        assert!(text.starts_with("ALERT: traffic_spike in auth-service (gcp-cloud)"));
        assert!(text.contains("Requests: 42"));
    }

    #[test]
    fn test_fallback_alert_layout() {
        let text = fallback_alert(&server_error(), "ALERT:");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ALERT: server_error in payment-service (aws-cloud)");
        assert_eq!(lines[1], "Status: 503");
        assert_eq!(lines[2], "Response Time: 5400.00ms");
        assert_eq!(lines[3], "Timestamp: 2024-01-01 12:00:00 UTC");
        assert!(lines[4].starts_with("Probable Cause:"));
        assert!(lines[5].starts_with("Recommended Action:"));
    }

    #[test]
    fn test_report_statistics_ties_break_by_name() {
        let anomalies = vec![
            Anomaly::from_record(
                record("user-service", "on-prem", 200, 90.0),
                AnomalyType::Behavioral,
                -0.01,
            ),
            Anomaly::from_record(
                record("auth-service", "on-prem", 404, 90.0),
                AnomalyType::ClientError,
                -0.02,
            ),
        ];
        let stats = ReportStatistics::from_anomalies(&anomalies);
        assert_eq!(stats.environments.get("on-prem"), Some(&2));
        assert_eq!(stats.most_affected_service(), Some("auth-service"));
        assert_eq!(stats.most_common_type(), Some("behavioral"));
    }

    #[test]
    fn test_line_severity() {
        let alerter = AlertGenerator::new(AlertConfig::default(), None);
        assert_eq!(alerter.line_severity("ALERT: high latency"), LineSeverity::Warning);
        assert_eq!(alerter.line_severity("  ALERT: indented"), LineSeverity::Warning);
        assert_eq!(alerter.line_severity("Probable Cause: db"), LineSeverity::Info);
    }

    #[tokio::test]
    async fn test_custom_marker_reaches_prompt_and_routing() {
        let config = AlertConfig {
            alert_marker: "[CRITICAL]".to_string(),
            ..fast_config()
        };
        let alerter = AlertGenerator::new(config, Some(Arc::new(InstructionFollowingGenerator)));

        let text = alerter.generate_alert_message(&server_error()).await;
        let mut lines = text.lines();
        let first = lines.next().unwrap();
        assert_eq!(first, "[CRITICAL] payment-service failing");
        assert_eq!(alerter.line_severity(first), LineSeverity::Warning);
        assert_eq!(alerter.line_severity(lines.next().unwrap()), LineSeverity::Info);
    }

    #[test]
    fn test_alert_prompt_names_marker() {
        let prompt = alert_prompt(&server_error(), "[CRITICAL]");
        assert!(prompt.contains("(start with '[CRITICAL]')"));
        assert!(!prompt.contains("ALERT:"));
    }
}
