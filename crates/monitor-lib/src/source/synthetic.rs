//! Synthetic API traffic
//!
//! Produces records for four services across four environments. Normal
//! latency follows a per-environment normal distribution; a configurable
//! share of events is anomalous:
//! - slow requests (latency multiplied by 5 to 20)
//! - server errors (500/503 with doubled latency)
//! - traffic bursts (one request repeated many times at a single instant)

use super::RecordSource;
use crate::models::ApiRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;
use std::sync::Mutex;
use std::time::Duration;

pub const SERVICES: [&str; 4] = [
    "user-service",
    "payment-service",
    "inventory-service",
    "auth-service",
];

pub const ENVIRONMENTS: [&str; 4] = ["on-prem", "aws-cloud", "azure-cloud", "gcp-cloud"];

const SUCCESS_CODES: [u16; 2] = [200, 201];
const ERROR_CODES: [u16; 6] = [400, 401, 403, 404, 500, 503];
const SERVER_ERROR_CODES: [u16; 2] = [500, 503];
const CLIENT_LANGUAGES: [&str; 4] = ["nodejs", "golang", "python", "java"];

/// Share of organic (non-anomalous) requests that fail
const ORGANIC_ERROR_RATE: f64 = 0.05;
const LATENCY_STD_MS: f64 = 20.0;
const MIN_LATENCY_MS: f64 = 10.0;
const USER_POOL: u32 = 1000;

fn base_latency_ms(environment: &str) -> f64 {
    match environment {
        "on-prem" => 80.0,
        "aws-cloud" => 120.0,
        "azure-cloud" => 150.0,
        "gcp-cloud" => 100.0,
        _ => 100.0,
    }
}

fn endpoints(service: &str) -> &'static [&'static str] {
    match service {
        "user-service" => &["/users", "/users/{id}", "/users/search"],
        "payment-service" => &["/payments", "/payments/{id}", "/payments/verify"],
        "inventory-service" => &["/products", "/products/{id}", "/inventory"],
        "auth-service" => &["/auth/login", "/auth/register", "/auth/token"],
        _ => &["/"],
    }
}

/// Configuration for the synthetic source
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Events per live batch, drawn uniformly
    pub batch_size: RangeInclusive<usize>,
    /// Anomalous share of live events
    pub anomaly_ratio: f64,
    /// Anomalous share of historical events
    pub training_anomaly_ratio: f64,
    /// Time covered by one live batch, ending now
    pub live_span: Duration,
    /// Time covered by the historical corpus, ending now
    pub history_span: Duration,
    /// Copies of the request emitted by one traffic burst
    pub burst_size: usize,
    /// Fixed seed for reproducible output; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            batch_size: 50..=200,
            anomaly_ratio: 0.05,
            training_anomaly_ratio: 0.1,
            live_span: Duration::from_secs(60),
            history_span: Duration::from_secs(3 * 60 * 60),
            burst_size: 30,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnomalyKind {
    Latency,
    ServerError,
    Burst,
}

/// Generator-backed [`RecordSource`]
pub struct SyntheticRecordSource {
    config: SyntheticConfig,
    rng: Mutex<StdRng>,
}

impl SyntheticRecordSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// Generate `count` events spread over `span` ending at `end`, sorted by time.
    ///
    /// Bursts, when enabled, add duplicates on top of `count`.
    pub fn generate(
        &self,
        count: usize,
        anomaly_ratio: f64,
        end: DateTime<Utc>,
        span: Duration,
        bursts: bool,
    ) -> Vec<ApiRecord> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let span_ms = span.as_millis().max(1) as i64;

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = chrono::Duration::milliseconds(rng.gen_range(0..span_ms));
            let mut record = normal_record(&mut *rng, end - offset);

            if rng.gen::<f64>() < anomaly_ratio {
                let kinds: &[AnomalyKind] = if bursts {
                    &[AnomalyKind::Latency, AnomalyKind::ServerError, AnomalyKind::Burst]
                } else {
                    &[AnomalyKind::Latency, AnomalyKind::ServerError]
                };
                match kinds.choose(&mut *rng).copied().unwrap_or(AnomalyKind::Latency) {
                    AnomalyKind::Latency => {
                        let factor = rng.gen_range(5.0..20.0);
                        record.response_time_ms = round2(record.response_time_ms * factor);
                    }
                    AnomalyKind::ServerError => {
                        record.status_code = pick(&mut *rng, &SERVER_ERROR_CODES);
                        record.response_time_ms = round2(record.response_time_ms * 2.0);
                    }
                    AnomalyKind::Burst => {
                        let copies = self.config.burst_size.saturating_sub(1);
                        records.extend(std::iter::repeat(record.clone()).take(copies));
                    }
                }
            }
            records.push(record);
        }

        records.sort_by_key(|r| r.timestamp);
        records
    }
}

fn pick<T: Copy>(rng: &mut StdRng, items: &[T]) -> T {
    items[rng.gen_range(0..items.len())]
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Box-Muller sample from N(mean, std)
fn sample_normal(rng: &mut StdRng, mean: f64, std: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    mean + std * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn normal_record(rng: &mut StdRng, timestamp: DateTime<Utc>) -> ApiRecord {
    let service = pick(rng, &SERVICES);
    let environment = pick(rng, &ENVIRONMENTS);

    let mut response_time_ms =
        sample_normal(rng, base_latency_ms(environment), LATENCY_STD_MS).max(MIN_LATENCY_MS);
    let status_code = if rng.gen::<f64>() < ORGANIC_ERROR_RATE {
        response_time_ms *= 1.5;
        pick(rng, &ERROR_CODES)
    } else {
        pick(rng, &SUCCESS_CODES)
    };

    ApiRecord {
        timestamp,
        service: service.to_string(),
        environment: environment.to_string(),
        status_code,
        response_time_ms: round2(response_time_ms),
        user_id: format!("user_{}", rng.gen_range(0..USER_POOL)),
        endpoint: pick(rng, endpoints(service)).to_string(),
        request_size: rng.gen_range(100..=5000),
        response_size: rng.gen_range(50..=3000),
        client_language: pick(rng, &CLIENT_LANGUAGES).to_string(),
    }
}

#[async_trait]
impl RecordSource for SyntheticRecordSource {
    async fn fetch_batch(&self) -> Result<Vec<ApiRecord>> {
        let count = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(self.config.batch_size.clone())
        };
        Ok(self.generate(count, self.config.anomaly_ratio, Utc::now(), self.config.live_span, true))
    }

    async fn fetch_history(&self, count: usize) -> Result<Vec<ApiRecord>> {
        Ok(self.generate(
            count,
            self.config.training_anomaly_ratio,
            Utc::now(),
            self.config.history_span,
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> SyntheticRecordSource {
        SyntheticRecordSource::new(SyntheticConfig {
            seed: Some(seed),
            ..Default::default()
        })
    }

    #[test]
    fn test_history_shape() {
        let source = seeded(7);
        let end = Utc::now();
        let records = source.generate(2000, 0.1, end, Duration::from_secs(3600), false);

        assert_eq!(records.len(), 2000);
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(records.iter().all(|r| r.timestamp <= end));
        assert!(records.iter().all(|r| r.response_time_ms >= MIN_LATENCY_MS));
        assert!(records.iter().all(|r| SERVICES.contains(&r.service.as_str())));
        assert!(records.iter().all(|r| ENVIRONMENTS.contains(&r.environment.as_str())));
        assert!(records.iter().any(|r| r.status_code >= 500));
    }

    #[test]
    fn test_same_seed_same_records() {
        let end = Utc::now();
        let a = seeded(42).generate(100, 0.05, end, Duration::from_secs(60), true);
        let b = seeded(42).generate(100, 0.05, end, Duration::from_secs(60), true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_bursts_add_duplicates() {
        let source = SyntheticRecordSource::new(SyntheticConfig {
            seed: Some(3),
            burst_size: 10,
            ..Default::default()
        });
        // every event anomalous, so roughly a third of them burst
        let records = source.generate(60, 1.0, Utc::now(), Duration::from_secs(60), true);
        assert!(records.len() > 60);
        assert_eq!((records.len() - 60) % 9, 0);
    }

    #[tokio::test]
    async fn test_fetch_batch_size_in_range() {
        let source = seeded(11);
        for _ in 0..5 {
            let batch = source.fetch_batch().await.unwrap();
            // bursts can only add records
            assert!(batch.len() >= 50);
        }
        let history = source.fetch_history(500).await.unwrap();
        assert_eq!(history.len(), 500);
    }
}
