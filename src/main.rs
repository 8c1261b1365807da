use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod analytics;
mod assignment;
mod camera;
mod config;
mod notify;
mod registry;
mod store;

use analytics::{EngineSettings, EventPipeline};
use assignment::AssignmentPublisher;
use camera::{CaptureSettings, CaptureSupervisor, StreamOpener};
use config::{Config, ConfigError};
use notify::{LogNotifier, Notifier, WebhookNotifier};
use registry::HttpRegistry;
use store::RedisStore;

#[derive(Debug, Parser)]
#[command(name = "visionflow", version, about = "Camera ingestion and zone event engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the camera registry and publish per-worker assignments
    Publisher,
    /// Run the capture tasks for this worker (requires WORKER_ID)
    Worker,
    /// Run detection and dwell tracking over live cameras
    Engine,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("visionflow=debug".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Command::Publisher => run_publisher(config, shutdown_rx).await?,
        Command::Worker => run_worker(config, shutdown_rx).await?,
        Command::Engine => run_engine(config, shutdown_rx).await?,
    }

    tracing::info!("shutdown complete");
    Ok(())
}

fn registry(config: &Config) -> Result<Arc<HttpRegistry>, registry::RegistryError> {
    Ok(Arc::new(HttpRegistry::new(
        &config.registry.base_url,
        config.registry.zone_url.as_deref(),
        config.registry.timeout(),
    )?))
}

async fn run_publisher(
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(RedisStore::connect(&config.store.url).await?);
    tracing::info!(workers = config.workers.count, registry = %config.registry.base_url, "starting publisher");

    let publisher = AssignmentPublisher::new(
        store,
        registry(&config)?,
        config.workers.count,
        config.registry.poll_interval(),
        config.registry.timeout(),
    );
    publisher.run(shutdown).await;
    Ok(())
}

async fn run_worker(
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = config
        .worker_id()
        .inspect_err(|e| tracing::error!(error = %e, "cannot start capture worker"))?;

    let store = Arc::new(RedisStore::connect(&config.store.url).await?);
    tracing::info!(worker_id, of = config.workers.count, "starting capture worker");

    let opener = Arc::new(StreamOpener::new(
        config.capture.sample_fps,
        config.capture.jpeg_quality,
    ));
    let supervisor = CaptureSupervisor::new(
        worker_id,
        store,
        opener,
        CaptureSettings::from(&config.capture),
        config.capture.max_concurrent_cameras,
        Duration::from_secs(config.capture.liveness_interval_secs.max(1)),
    );
    supervisor.run(shutdown).await?;
    Ok(())
}

async fn run_engine(
    config: Config,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(default_model) = config.models.first().map(|m| m.name.clone()) else {
        return Err(ConfigError::Invalid("engine needs at least one [[models]] entry".into()).into());
    };
    let detectors = analytics::load_detectors(&config.models)?;

    let store = Arc::new(RedisStore::connect(&config.store.url).await?);
    let notifier: Arc<dyn Notifier> = match config.notify.webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.notify.timeout_secs),
        )?),
        None => {
            tracing::warn!("no webhook configured, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let pipeline = EventPipeline::new(
        store,
        registry(&config)?,
        detectors,
        default_model,
        notifier,
        EngineSettings::from_config(&config),
    );
    pipeline.run(shutdown).await;
    Ok(())
}
