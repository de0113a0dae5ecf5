use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};

use fluxgate::Router;

#[derive(Parser, Debug)]
#[command(name = "fluxgate", about = "Dynamic edge router", version)]
struct Args {
    /// Path to the static configuration file
    #[arg(short, long, default_value = "fluxgate.yml")]
    config: String,

    /// Log filter, e.g. "info" or "fluxgate=debug"
    #[arg(long, default_value = "info,fluxgate=debug")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(args.log_filter)
        .init();

    // Initialize metrics
    fluxgate::metrics::init_metrics()?;

    // Load configuration
    let router = Router::from_file(&args.config)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            let _ = shutdown_tx.send(());
        } else {
            error!("Unable to listen for the interrupt signal");
        }
    });

    router
        .start(shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("Router error: {}", e))?;

    Ok(())
}
