//! bankcoord Coordinator Binary
//!
//! Connects to every configured branch, then accepts client sessions.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bankcoord_coordinator::{Coordinator, CoordinatorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = CoordinatorConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting bankcoord coordinator");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    // Generate node ID if not provided
    let node_id = config
        .node_id
        .clone()
        .unwrap_or_else(|| format!("coordinator-{}", uuid::Uuid::new_v4()));

    info!(node_id = %node_id, "Node ID assigned");

    let coordinator = Arc::new(Coordinator::new(config.clone(), node_id.clone()));

    // Set up graceful shutdown
    let coordinator_clone = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Shutdown signal received");
        if let Err(e) = coordinator_clone.stop().await {
            error!(error = %e, "Error during shutdown");
        }
    });

    info!(
        node_id = %node_id,
        listen_addr = %config.listen_addr,
        listen_port = %config.listen_port,
        branches = config.participant_config.branches.len(),
        "Coordinator running"
    );

    coordinator.run().await?;

    info!("Coordinator shutdown complete");
    Ok(())
}
