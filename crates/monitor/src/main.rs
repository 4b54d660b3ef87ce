//! API monitor
//!
//! Trains per-segment outlier models over API request logs, then watches
//! new traffic for anomalous requests and volume spikes, raising alerts.

use anyhow::{Context, Result};
use clap::Parser;
use monitor_lib::{
    health::{components, HealthRegistry},
    llm::{GeminiClient, TextGenerator},
    monitor::MonitoringSystemBuilder,
    observability::MonitorMetrics,
    source::SyntheticRecordSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[derive(Parser)]
#[command(name = "api-monitor")]
#[command(
    author,
    version,
    about = "Anomaly detection and alerting for API traffic",
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "MONITOR_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Ignore persisted models and train from scratch
    #[arg(long)]
    retrain: bool,

    /// Run a single monitoring iteration and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let mut app_config = config::AppConfig::load(cli.config.as_deref())?;
    app_config.force_retrain |= cli.retrain;
    info!(
        instance = %app_config.instance,
        interval_secs = app_config.interval_secs,
        model_dir = %app_config.model_dir.display(),
        "Monitor configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let metrics = MonitorMetrics::new();

    let client = GeminiClient::from_config(app_config.gemini.clone())
        .context("Failed to create text service client")?;
    let generator: Option<Arc<dyn TextGenerator>> = match client {
        Some(client) => {
            info!(model = %app_config.gemini.model, "Text service enabled");
            Some(Arc::new(client) as Arc<dyn TextGenerator>)
        }
        None => {
            info!("No text service API key, alerts use fallback text");
            health_registry
                .set_degraded(components::ALERTER, "Text service disabled")
                .await;
            None
        }
    };

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(app_config.api_port, app_state));

    let source = Arc::new(SyntheticRecordSource::new(app_config.synthetic_config()));
    let mut system = MonitoringSystemBuilder::new()
        .config(app_config.monitor_config())
        .detection(app_config.detection.clone())
        .traffic(app_config.traffic_config())
        .alert(app_config.alert_config())
        .source(source)
        .generator(generator)
        .health(health_registry)
        .instance(app_config.instance.clone())
        .build()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                let _ = signal_tx.send(());
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    let result = if cli.once {
        system.run_once(shutdown_rx).await.map(|summary| match summary {
            Some(summary) => info!(
                records = summary.records,
                anomalies = summary.anomalies,
                traffic_spikes = summary.traffic_spikes,
                unscored_records = summary.unscored_records,
                "Single iteration complete"
            ),
            None => info!("Single iteration interrupted"),
        })
    } else {
        system.run(shutdown_rx).await
    };

    api_handle.abort();
    drop(shutdown_tx);

    info!(state = %system.state(), "Monitor stopped");
    result.map_err(Into::into)
}
