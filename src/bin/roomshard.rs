//! roomshard service binary
//!
//! Connects every room shard, provisions its series, optionally backfills
//! history, then runs live generation, the archival pipeline and the HTTP API
//! until SIGINT/SIGTERM.

use roomshard::api::{self, ApiServerConfig, ApiState};
use roomshard::archive::ArchivalPipeline;
use roomshard::clock::{Clock, SystemClock};
use roomshard::config::ComponentFactory;
use roomshard::ingest::TelemetryGenerator;
use roomshard::query::TelemetryQueries;
use roomshard::report::ReportWriter;
use roomshard::sharding::{SeriesProvisioner, ShardConnectionManager, ShardRegistry, ShardRouter};
use roomshard::telemetry::init_logging;
use roomshard::{Config, Error};

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Room-sharded IoT time-series service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; defaults apply when absent
    #[arg(long, env = "ROOMSHARD_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "HTTP_PORT", default_value = "5000")]
    http_port: u16,

    /// Directory for the topology snapshot
    #[arg(long, env = "METADATA_DIR", default_value = "sharding_metadata")]
    metadata_dir: PathBuf,

    /// Skip the historical backfill
    #[arg(long)]
    no_backfill: bool,

    /// Do not generate live telemetry
    #[arg(long)]
    no_generator: bool,

    /// Do not run the archival pipeline
    #[arg(long)]
    no_archive: bool,

    /// Live generation interval (e.g. "30s"); overrides the config file
    #[arg(long)]
    live_interval: Option<humantime::Duration>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging("roomshard", &args.log_level)?;

    info!("Starting roomshard");

    let config = Config::load_or_default(args.config.as_deref())?;
    let registry = Arc::new(ShardRegistry::new(&config.sharding)?);

    let connector = ComponentFactory::create_connector(&registry, &config.sharding.connection)?;
    let mut manager =
        ShardConnectionManager::new(Arc::clone(&registry), connector, &config.sharding.connection);
    if let Some(discovery) = ComponentFactory::create_discovery(&config.sharding.connection)? {
        manager = manager.with_discovery(discovery);
    }
    let manager = Arc::new(manager);

    for (location, outcome) in manager.connect_all().await {
        if let Err(e) = outcome {
            warn!(location = %location, error = %e, "Shard offline at startup");
        }
    }

    if let Err(e) = ReportWriter::new(&args.metadata_dir)
        .write_config_snapshot(&registry)
        .await
    {
        warn!(error = %e, "Failed to write topology snapshot");
    }

    let provisioned = SeriesProvisioner::new(manager.op_timeout())
        .provision_all(&manager)
        .await;
    info!(
        created = provisioned.created.len(),
        existing = provisioned.existing.len(),
        failed = provisioned.failed.len(),
        skipped = provisioned.skipped_locations.len(),
        "Series provisioning complete"
    );

    let router = ShardRouter::new(Arc::clone(&manager))
        .with_fan_out_deadline(config.sharding.connection.fan_out_deadline());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    if !args.no_generator {
        let generator = Arc::new(TelemetryGenerator::new(
            router.clone(),
            Arc::clone(&clock),
            config.generator.clone(),
        ));
        if config.generator.backfill_on_start && !args.no_backfill {
            generator.backfill_configured().await;
        }

        let interval = args
            .live_interval
            .map(Into::into)
            .unwrap_or_else(|| config.generator.live_interval());
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            generator.run_live(interval, token).await;
        }));
    }

    if !args.no_archive {
        let sink = ComponentFactory::create_sink(&config.sink)?;
        let pipeline = Arc::new(ArchivalPipeline::new(
            router.clone(),
            sink,
            Arc::clone(&clock),
            config.archive.clone(),
        ));
        let pipeline_token = pipeline.shutdown_token();
        let root = shutdown.clone();
        tokio::spawn(async move {
            root.cancelled().await;
            pipeline_token.cancel();
        });
        tasks.push(tokio::spawn(async move {
            pipeline.run().await;
        }));
    }

    let state = ApiState {
        queries: TelemetryQueries::new(router, Arc::clone(&clock)),
        manager: Arc::clone(&manager),
    };
    let api_config = ApiServerConfig {
        http_port: args.http_port,
        ..ApiServerConfig::default()
    };
    let app = api::build_http_router(state, &api_config);

    let addr = SocketAddr::from(([0, 0, 0, 0], api_config.http_port));
    let listener = TcpListener::bind(addr).await?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    info!(http_port = api_config.http_port, "roomshard ready");

    let server_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")));
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task failed");
        }
    }
    for location in registry.configured_locations() {
        let _ = manager.disconnect(location.as_str()).await;
    }

    info!("roomshard shut down");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
