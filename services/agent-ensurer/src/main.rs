//! agent-ensurer
//!
//! Polls a CI server and launches cloud instances whenever fewer than the
//! configured number of alive idle agents are available.
//!
//! ## Architecture
//!
//! - **Config**: Parsed once at startup, token indirection resolved
//! - **Server Client**: Fetches agents and instances, launches instances
//! - **Reconciler**: Probe once, then fetch, classify, launch, sleep

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent_ensurer::{Cli, Config, LogFormat, Reconciler, ReconcilerConfig, ServerClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_cli(Cli::parse())?;

    init_tracing(&config);

    info!(
        base_url = %config.base_url,
        cloud_profile_id = %config.cloud_profile_id,
        min_idle_agents = config.min_idle_agents,
        "Configuration loaded"
    );

    let client = ServerClient::new(&config)?;
    let reconciler = Reconciler::new(client, ReconcilerConfig::from(&config));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    reconciler.run(shutdown_rx).await?;

    info!("agent-ensurer shutdown complete");
    Ok(())
}

/// Initialize tracing (prefer RUST_LOG, fallback to --log-level).
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
