//! skymark-scorer - Scoring authority service
//!
//! Creates matches (tag -> points tables) and answers tag decode and match
//! key verification requests from the relay.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use skymark_common::config::{ConfigResolver, ScorerConfig};
use skymark_common::logging;
use tokio::signal;
use tracing::info;

use skymark_scorer::{build_router, AppState, PointsPolicy};

/// Command-line arguments for skymark-scorer
#[derive(Parser, Debug)]
#[command(name = "skymark-scorer")]
#[command(about = "Scoring authority for skymark matches")]
#[command(version)]
struct Args {
    /// Config file (overrides SKYMARK_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "SKYMARK_SCORER_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SKYMARK_SCORER_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_filter = logging::init(&["skymark_scorer", "skymark_common", "tower_http"]);

    // Build identification first, before anything that may block
    info!(
        "Starting skymark-scorer v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let resolver = ConfigResolver::new("scorer");
    let mut config: ScorerConfig = resolver
        .load(args.config.as_deref())
        .context("Failed to load configuration")?;
    log_filter
        .apply_level(&config.logging.level)
        .context("Invalid logging configuration")?;

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("Invalid configuration")?;

    let policy = PointsPolicy::from(&config.points);
    info!(
        "Points: {}..={}, penalty {} with chance {}",
        policy.min_points, policy.max_points, policy.penalty_value, policy.penalty_chance
    );

    let app = build_router(AppState::new(policy));

    let addr = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("skymark-scorer listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
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
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
