//! ERA5 background downloader.
//!
//! Prepares reanalysis data for a catalog of lidar observations with:
//! - Bounded concurrency (one task per observation)
//! - Resumable runs: anything already in the cache is skipped
//! - Model-level interpolation through an external command
//! - Outcome ledger and HTTP status API for monitoring
//! - Graceful drain on Ctrl+C

mod config;
mod ledger;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use era5_prep::{
    ArtifactNamer, CancellationToken, Catalog, CdsClient, CommandInterpolator, FilenameDecoder,
    ObservationDecoder, Pipeline,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::{CatalogSource, RunConfig};
use ledger::OutcomeLedger;
use server::ServerState;

#[derive(Parser, Debug)]
#[command(name = "era5-downloader")]
#[command(about = "Prepare ERA5 backgrounds for lidar observations")]
struct Args {
    /// Run configuration file
    #[arg(short, long, env = "ERA5_CONFIG", default_value = "config/era5-downloader.yaml")]
    config: PathBuf,

    /// Maximum concurrent observations (overrides the config file)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for the outcome ledger database
    #[arg(long, default_value = "/data/era5-downloader")]
    state_dir: PathBuf,

    /// Port for status HTTP server
    #[arg(long, env = "STATUS_PORT", default_value = "8081")]
    status_port: u16,

    /// Disable status HTTP server
    #[arg(long)]
    no_status_server: bool,

    /// Port for the Prometheus scrape endpoint (disabled when unset)
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(port) = args.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port = port, "Prometheus metrics exporter initialized");
    }

    info!(config = %args.config.display(), "Starting ERA5 downloader");

    let config = RunConfig::load(&args.config)?;
    let pipeline_config = config.pipeline_config(args.max_concurrent)?;
    let instrument = config.instrument();

    // Enumeration failures are the only run-level error
    let (catalog, decoder) = open_catalog(&config)?;
    info!(
        observations = catalog.len(),
        instrument = %instrument,
        "Observation catalog ready"
    );

    let client = Arc::new(CdsClient::new(config.cds.client_config()?)?);
    let interpolator = Arc::new(CommandInterpolator::new(
        config.interpolation.command.clone(),
        config.interpolation.timeout(),
    )?);
    let namer = ArtifactNamer::new(
        config.output.cache_root(),
        pipeline_config.retrieval.extension(),
    );

    let pipeline = Pipeline::new(pipeline_config, client, interpolator, decoder, namer)?;

    tokio::fs::create_dir_all(&args.state_dir).await?;
    let ledger_path = args.state_dir.join("outcomes.db");
    let ledger = Arc::new(
        OutcomeLedger::open(&ledger_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", ledger_path.display()))?,
    );

    if !args.no_status_server {
        let server_state = Arc::new(ServerState {
            progress: pipeline.progress(),
            ledger: ledger.clone(),
            instrument: instrument.to_string(),
            started_at: Utc::now(),
        });
        let status_port = args.status_port;
        tokio::spawn(async move {
            if let Err(e) = server::run_server(server_state, status_port).await {
                error!(error = %e, "Status server failed");
            }
        });
    }

    // Ctrl+C stops admission; admitted observations still finish
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, draining admitted observations");
            shutdown_trigger.cancel();
        }
    });

    let report = pipeline.run(catalog.into_entries(), shutdown).await;

    // Per-observation failures and a lost ledger write still exit 0
    let run_id = ledger.record_or_log(instrument.as_str(), &report).await;

    for failure in report.failures() {
        let previous = match run_id {
            Some(_) => ledger
                .failure_count(failure.observation.as_str())
                .await
                .unwrap_or_default(),
            None => 0,
        };
        warn!(
            observation = %failure.observation,
            path = %failure.path.display(),
            outcome = ?failure.outcome,
            failed_runs = previous,
            "Observation failed"
        );
    }

    info!(
        run_id = ?run_id,
        total = report.tally.total(),
        done = report.tally.done,
        skipped = report.tally.skipped,
        failed = report.tally.failed,
        cancelled = report.tally.cancelled,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "ERA5 preparation session complete"
    );

    Ok(())
}

/// Enumerate the observations and pick the decoder that matches the source.
fn open_catalog(config: &RunConfig) -> Result<(Catalog, Arc<dyn ObservationDecoder>)> {
    let instrument = config.instrument();
    let prefix_len = config.input.id_prefix_len;

    let (catalog, decoder): (Catalog, Arc<dyn ObservationDecoder>) =
        match config.input.source()? {
            CatalogSource::Manifest(path) => {
                let (catalog, decoder) = Catalog::from_manifest(&path, prefix_len, instrument)?;
                let decoder: Arc<dyn ObservationDecoder> = Arc::new(decoder);
                (catalog, decoder)
            }
            CatalogSource::File(path) => {
                let decoder: Arc<dyn ObservationDecoder> =
                    Arc::new(FilenameDecoder::new(instrument));
                (Catalog::from_file(&path, prefix_len)?, decoder)
            }
            CatalogSource::Directory { folder, pattern } => {
                let decoder: Arc<dyn ObservationDecoder> =
                    Arc::new(FilenameDecoder::new(instrument));
                (Catalog::from_directory(&folder, &pattern, prefix_len)?, decoder)
            }
        };

    Ok((catalog, decoder))
}
