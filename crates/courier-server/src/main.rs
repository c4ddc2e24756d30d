//! # Courier Server
//!
//! Clustered realtime messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with a custom config file
//! COURIER_CONFIG=/path/to/courier.toml courier
//!
//! # Override settings with environment variables
//! COURIER__PORT=8080 COURIER__CLUSTER__NODE=n2 courier
//! ```

use anyhow::Result;
use courier_server::{config::Config, metrics, run_server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tenvis_courier_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!(
        node = %config.cluster.node,
        peers = config.cluster.peers.len(),
        "Starting Courier server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    run_server(config).await?;

    Ok(())
}
