//! bankcoord Branch Binary
//!
//! Serves one branch's accounts to the coordinator.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bankcoord_participant::{BranchConfig, BranchServer, Ledger, LedgerHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BranchConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let handler = Arc::new(LedgerHandler::new(Arc::new(Ledger::new())));
    let server = BranchServer::bind(&config.bind_addr(), handler).await?;

    info!(
        branch = %config.branch_id,
        addr = %server.local_addr()?,
        "Branch running"
    );

    tokio::select! {
        result = server.serve() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    info!("Branch shutdown complete");
    Ok(())
}
