use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tunnelgate::api::{ApiContext, ApiServer};
use tunnelgate::config::Config;
use tunnelgate::db::Database;
use tunnelgate::health::HealthAggregator;
use tunnelgate::lifecycle::{CoreBinary, ServerLifecycleManager};
use tunnelgate::node_agent::NodeAgentClient;
use tunnelgate::registry::CoreRegistry;
use tunnelgate::reset::ResetOrchestrator;
use tunnelgate::scheduler::ResetScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunnelgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    std::fs::create_dir_all(&config.panel.data_dir)?;

    // Open the store
    let db = Arc::new(Database::open(config.panel.data_dir.join("panel.db"))?);

    // One lifecycle manager per enabled core
    let settings = config.panel.lifecycle_settings();
    let mut registry = CoreRegistry::new();
    for &core in &config.panel.cores {
        let binary = CoreBinary::for_core(core, &config.panel.bin_dir);
        let manager =
            ServerLifecycleManager::new(core, &config.panel.data_dir, binary, settings.clone())?;
        registry.insert(Arc::new(manager));
    }
    let registry = Arc::new(registry);
    info!(cores = ?config.panel.cores, "Lifecycle managers initialized");

    let agent = Arc::new(NodeAgentClient::new(Duration::from_secs(
        config.panel.node_agent_timeout_secs,
    ))?);
    let orchestrator = Arc::new(ResetOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&db),
        Arc::clone(&agent),
    ));
    let health = HealthAggregator::new(Arc::clone(&registry), Arc::clone(&db), Arc::clone(&agent));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn the reset scheduler if enabled
    if config.scheduler.enabled {
        let scheduler = ResetScheduler::new(
            Arc::clone(&db),
            Arc::clone(&orchestrator),
            Duration::from_secs(config.scheduler.tick_secs),
            shutdown_rx.clone(),
        );
        tokio::spawn(async move {
            scheduler.run().await;
        });
    }

    // Spawn the API server
    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    let context = Arc::new(ApiContext {
        db: Arc::clone(&db),
        health,
        orchestrator: Arc::clone(&orchestrator),
    });
    let api_server = ApiServer::new(api_addr, context, shutdown_rx.clone());
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Stop all tunnel servers
    info!("Stopping all tunnel servers...");
    registry.cleanup_all().await;

    // Wait for the API server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}
