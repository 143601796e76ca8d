use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use tessera::config::{self, Config};
use tessera::metrics;
use tessera::pool::{ConnectionFactory, MySqlConnectionFactory, PoolManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    let factory: Arc<dyn ConnectionFactory> = Arc::new(MySqlConnectionFactory::new(
        config.system.max_packet_size,
        config.system.backend_queue_capacity,
    ));
    let pools = Arc::new(PoolManager::new(&config, factory));

    let ready = pools.init_all().await;
    info!(
        ready,
        nodes = config.data_nodes.len(),
        heartbeat_period_ms = config.system.heartbeat_period_ms,
        "Backend pools started"
    );

    let shutdown = CancellationToken::new();
    let timers = pools.spawn_timers(shutdown.clone());

    if let Some(addr) = config.system.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&addr).await {
                error!(error = %e, "Metrics server stopped");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();
    for timer in timers {
        let _ = timer.await;
    }
    for node in pools.nodes() {
        node.stop_heartbeat();
        for source in node.sources() {
            source.clear();
        }
    }
    Ok(())
}

fn load_or_default_config() -> Config {
    // Try to load from config file
    let config_paths = ["config/tessera.toml", "tessera.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
