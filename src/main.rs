//! Export archiver entry point.
//!
//! Loads configuration, wires the recorder client, S3 archiver and
//! connectivity gate into the reconciler, and drives the three cycles on
//! their minute-grid schedules until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use export_archiver::config::{Config, ServiceConfig};
use export_archiver::connectivity::TcpProbe;
use export_archiver::reconciler::Reconciler;
use export_archiver::recorder_client::RecorderClient;
use export_archiver::s3_archiver::S3Archiver;
use export_archiver::scheduler::{run_cycle, Schedule};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting export archiver"
    );

    config.validate().context("Invalid configuration")?;
    ensure_aws_credentials()?;

    info!(
        cameras = ?config.recorder.cameras,
        bucket = %config.s3.bucket,
        region = %config.s3.region,
        recorder = %config.recorder.base_url,
        "Configuration loaded"
    );

    init_metrics(config.service.metrics_port)?;

    let zone = config.zone()?;
    let recorder = RecorderClient::new(&config.recorder.base_url, config.recorder_timeout())
        .context("Failed to build recorder client")?;
    let archiver = S3Archiver::new(&config.s3).await;
    let gate = TcpProbe::new(&config.s3.probe_addr, config.probe_timeout());

    let reconciler = Arc::new(Reconciler::new(
        recorder,
        archiver,
        gate,
        zone,
        config.recorder.cameras.clone(),
        config.recorder.exports_dir.clone(),
    ));

    let export_schedule = Schedule::new(
        config.schedule.export_period_minutes,
        config.schedule.export_offset_minutes,
    );
    let upload_schedule = Schedule::new(config.schedule.upload_period_minutes, 0);
    let stuck_schedule = Schedule::new(config.schedule.stuck_period_minutes, 0);

    let export_task = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            run_cycle("export", export_schedule, move || {
                let reconciler = reconciler.clone();
                async move { reconciler.run_export_cycle().await }
            })
            .await;
        }
    });

    let upload_task = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            run_cycle("upload", upload_schedule, move || {
                let reconciler = reconciler.clone();
                async move { reconciler.run_upload_cycle().await }
            })
            .await;
        }
    });

    let stuck_task = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            run_cycle("stuck", stuck_schedule, move || {
                let reconciler = reconciler.clone();
                async move { reconciler.run_stuck_cycle().await }
            })
            .await;
        }
    });

    info!(
        export_period = config.schedule.export_period_minutes,
        upload_period = config.schedule.upload_period_minutes,
        stuck_period = config.schedule.stuck_period_minutes,
        "Scheduler started"
    );

    shutdown_signal().await;

    info!("Shutting down export archiver");

    export_task.abort();
    upload_task.abort();
    stuck_task.abort();

    info!("Export archiver stopped");

    Ok(())
}

/// Initialize the tracing subscriber: JSON to stdout, plus a file sink
/// when `service.log_dir` is configured.
fn init_tracing(config: &ServiceConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json());

    if let Some(ref log_dir) = config.log_dir {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let file = std::fs::File::options()
            .create(true)
            .append(true)
            .open(log_dir.join("export-archiver.log"))
            .context("Failed to open log file")?;

        registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        registry.init();
    }

    Ok(())
}

/// Initialize the Prometheus metrics exporter.
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Uploads cannot start without credentials; refuse to boot rather than
/// fail every cycle.
fn ensure_aws_credentials() -> Result<()> {
    for var in ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"] {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => {}
            _ => anyhow::bail!("{var} is not set; AWS credentials are required"),
        }
    }
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
