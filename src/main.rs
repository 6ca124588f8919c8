use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Import modules from the library crate
use cadenza_server::blob_store::{BlobStore, S3BlobStore};
use cadenza_server::broker::BrokerConnector;
use cadenza_server::catalog_store::{CatalogStore, SqliteCatalogStore};
use cadenza_server::config;
use cadenza_server::election::{
    create_election, ConsulCoordinator, Coordinator, ElectionConfig, FailoverController,
};
use cadenza_server::health::{
    spawn_probe_loops, BlobStoreProbe, BrokerProbe, DatabaseProbe, HealthAggregator, ProbeSchedule,
};
use cadenza_server::ingest::{
    pump_deliveries, run_notification_listener, EnvelopeHandler, Reconciler, WorkerPool,
};
use cadenza_server::server::{metrics, run_server, RequestsLoggingLevel, ServerConfig};
use cadenza_server::server::state::ServerState;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing database files (catalog.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// AMQP URL of the message broker.
    #[clap(long)]
    pub broker_url: Option<String>,

    /// Queue carrying bucket change notifications.
    #[clap(long, default_value = "storage-events")]
    pub broker_queue: String,

    /// Number of concurrent delivery handlers in the worker pool.
    #[clap(long, default_value_t = 5)]
    pub workers: usize,

    /// HTTP address of the coordination backend.
    #[clap(long)]
    pub coordination_address: Option<String>,

    /// Name this replica registers under for leader election.
    #[clap(long)]
    pub node_name: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            logging_level: args.logging_level.clone(),
            broker_url: args.broker_url.clone(),
            broker_queue: args.broker_queue.clone(),
            workers: args.workers,
            coordination_address: args.coordination_address.clone(),
            node_name: args.node_name.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  port: {}", app_config.port);
    info!("  node_name: {}", app_config.coordination.node_name);
    info!("  election key: {}", app_config.coordination.key);
    info!("  broker queue: {}", app_config.broker.queue);
    info!("  worker pool size: {}", app_config.broker.workers);

    // Create catalog store (will create DB if not exists)
    let catalog_store = Arc::new(SqliteCatalogStore::new(app_config.catalog_db_path())?);

    // Initialize metrics system
    info!("Initializing metrics...");
    metrics::init_metrics();
    metrics::set_catalog_tracks(catalog_store.get_tracks_count());

    // One token governs every long-running loop in the core.
    let shutdown_token = CancellationToken::new();
    {
        let token = shutdown_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, initiating graceful shutdown");
                token.cancel();
            }
        });
    }

    // The broker is required at boot: block until connected, retrying at a
    // fixed delay, but let a shutdown request interrupt the wait.
    let connector = match BrokerConnector::connect(
        &app_config.broker.url,
        &app_config.broker.queue,
        app_config.broker.connect_retry,
        &shutdown_token,
    )
    .await
    {
        Some(connector) => Arc::new(connector),
        None => {
            info!("Shutdown requested before broker connection was established");
            return Ok(());
        }
    };

    let blob_store: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(&app_config.blob_store));

    // Health probing: one independent loop per dependency.
    let health = Arc::new(HealthAggregator::new());
    let probe_handles = spawn_probe_loops(
        Arc::clone(&health),
        vec![
            ProbeSchedule {
                probe: Arc::new(DatabaseProbe::new(
                    Arc::clone(&catalog_store) as Arc<dyn CatalogStore>
                )),
                interval: app_config.health.db_interval,
            },
            ProbeSchedule {
                probe: Arc::new(BrokerProbe::new(Arc::clone(&connector))),
                interval: app_config.health.broker_interval,
            },
            ProbeSchedule {
                probe: Arc::new(BlobStoreProbe::new(Arc::clone(&blob_store))),
                interval: app_config.health.blob_interval,
            },
        ],
        shutdown_token.child_token(),
    );

    // Leader election and health-driven failover.
    let coordinator: Arc<dyn Coordinator> =
        Arc::new(ConsulCoordinator::new(&app_config.coordination.address));
    let (election, election_handle) = create_election(
        coordinator,
        ElectionConfig {
            key: app_config.coordination.key.clone(),
            node_name: app_config.coordination.node_name.clone(),
            session_ttl: app_config.coordination.session_ttl,
            checks: app_config.coordination.checks.clone(),
            retry_interval: app_config.coordination.retry_interval,
        },
    );
    let election_task = tokio::spawn(election.run(shutdown_token.child_token()));

    let failover = FailoverController::new(health.subscribe(), election_handle.clone());
    let failover_task = tokio::spawn(failover.run(shutdown_token.child_token()));

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&catalog_store) as Arc<dyn CatalogStore>,
        Arc::clone(&blob_store),
    ));

    // Queue path: broker deliveries fanned out to the worker pool.
    let consumer = connector
        .consume(&app_config.coordination.node_name)
        .await?;
    let (delivery_tx, delivery_rx) = mpsc::channel(64);
    let pump_task = tokio::spawn(pump_deliveries(
        consumer,
        delivery_tx,
        shutdown_token.child_token(),
    ));
    let pool = WorkerPool::new(
        Arc::new(EnvelopeHandler::new(Arc::clone(&reconciler))),
        app_config.broker.workers,
    );
    let pool_task = {
        let token = shutdown_token.child_token();
        tokio::spawn(async move { pool.start_processing(token, delivery_rx).await })
    };

    // Push path: bucket notifications from the webhook route.
    let (notifications_tx, notifications_rx) = mpsc::channel(64);
    let listener_task = tokio::spawn(run_notification_listener(
        Arc::clone(&reconciler),
        notifications_rx,
        shutdown_token.child_token(),
    ));

    let state = ServerState {
        config: ServerConfig {
            port: app_config.port,
            logging_level: app_config.logging_level.clone(),
        },
        start_time: Instant::now(),
        catalog_store: Arc::clone(&catalog_store) as Arc<dyn CatalogStore>,
        health: Arc::clone(&health),
        election: election_handle,
        notifications_tx,
    };

    info!("Ready to serve at port {}!", app_config.port);
    let result = run_server(state, shutdown_token.clone()).await;
    if let Err(ref e) = result {
        error!("HTTP server stopped: {:?}", e);
    }

    // Supervised shutdown: stop every loop and let in-flight work drain.
    shutdown_token.cancel();
    for handle in probe_handles {
        let _ = handle.await;
    }
    let _ = pump_task.await;
    let _ = pool_task.await;
    let _ = listener_task.await;
    let _ = election_task.await;
    let _ = failover_task.await;
    if let Err(e) = connector.close().await {
        debug!("Broker connection close failed: {:#}", e);
    }

    info!("Application stopped");
    result
}
