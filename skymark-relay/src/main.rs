//! skymark-relay - Fusion and relay engine
//!
//! Streams platform telemetry and scored camera markers to the rendering
//! consumer as newline-delimited JSON.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use skymark_common::config::{ConfigResolver, RelayConfig, TelemetryModeSetting};
use skymark_common::logging;
use skymark_common::PlatformState;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skymark_relay::events::{self, DEFAULT_EVENT_CAPACITY};
use skymark_relay::fusion::{FusionInputs, FusionLoop};
use skymark_relay::telemetry::{
    LinkSettings, MavlinkSource, SyntheticGenerator, TelemetryLink, TelemetryMode,
};
use skymark_relay::vision::{
    Camera, RecordedDetector, ReplayCamera, UnavailableCamera, VisionSampler,
};
use skymark_relay::{MatchKey, RelayTransport, ScoringResolver};

/// Command-line arguments for skymark-relay
#[derive(Parser, Debug)]
#[command(name = "skymark-relay")]
#[command(about = "Relays platform telemetry and scored markers to the rendering consumer")]
#[command(version)]
struct Args {
    /// Config file (overrides SKYMARK_CONFIG and the default locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Consumer host
    #[arg(long, env = "SKYMARK_CONSUMER_HOST")]
    host: Option<String>,

    /// Consumer port
    #[arg(long, env = "SKYMARK_CONSUMER_PORT")]
    port: Option<u16>,

    /// Match key used for every tag lookup
    #[arg(long = "match", env = "SKYMARK_MATCH_KEY")]
    match_key: Option<String>,

    /// Scoring authority base URL
    #[arg(long, env = "SKYMARK_SERVER")]
    server: Option<String>,

    /// Telemetry mode: auto, live or synthetic
    #[arg(long)]
    telemetry_mode: Option<TelemetryModeSetting>,

    /// MAVLink connection string
    #[arg(long)]
    telemetry_endpoint: Option<String>,

    /// Directory of recorded frames to replay as the camera
    #[arg(long)]
    frames: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(host) = self.host {
            config.consumer.host = host;
        }
        if let Some(port) = self.port {
            config.consumer.port = port;
        }
        if let Some(key) = self.match_key {
            config.scoring.match_key = Some(key);
        }
        if let Some(server) = self.server {
            config.scoring.server_url = server;
        }
        if let Some(mode) = self.telemetry_mode {
            config.telemetry.mode = mode;
        }
        if let Some(endpoint) = self.telemetry_endpoint {
            config.telemetry.endpoint = endpoint;
        }
        if let Some(frames) = self.frames {
            config.vision.source = Some(frames);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_filter = logging::init(&["skymark_relay", "skymark_common"]);

    // Build identification first, before anything that may block
    info!(
        "Starting skymark-relay v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let resolver = ConfigResolver::new("relay");
    let mut config: RelayConfig = resolver
        .load(args.config.as_deref())
        .context("Failed to load configuration")?;
    log_filter
        .apply_level(&config.logging.level)
        .context("Invalid logging configuration")?;

    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let match_key = MatchKey::new(config.scoring.match_key.clone().unwrap_or_default());
    info!("Match key: {}", match_key);
    info!("Consumer: {}", config.consumer.address());
    info!("Scoring authority: {}", config.scoring.server_url);

    let cancel = CancellationToken::new();
    let (log, log_rx) = events::channel(DEFAULT_EVENT_CAPACITY);

    // Telemetry
    let settings = LinkSettings::from(&config.telemetry);
    let (state_tx, state_rx) = watch::channel(PlatformState::unknown(settings.log_capacity));
    let link = TelemetryLink::new(
        Box::new(MavlinkSource::new(config.telemetry.endpoint.clone())),
        settings.clone(),
    );
    let generator = SyntheticGenerator::new(settings.platform_id, settings.log_capacity);
    let telemetry_task = {
        let log = log.clone();
        let cancel = cancel.clone();
        let setting = config.telemetry.mode;
        tokio::spawn(async move {
            let mode = TelemetryMode::select(setting, link, generator, &log, &cancel).await;
            mode.run(state_tx, log, cancel).await;
        })
    };

    // Vision
    let camera: Box<dyn Camera> = match &config.vision.source {
        Some(dir) => {
            info!("Camera: replaying frames from {}", dir.display());
            Box::new(ReplayCamera::new(dir.clone()))
        }
        None => {
            warn!("Camera: no source configured");
            Box::new(UnavailableCamera)
        }
    };
    let (batch_tx, batch_rx) = watch::channel(None);
    let sampler = VisionSampler::new(
        camera,
        Box::new(RecordedDetector),
        config.vision.retry_delay(),
        log.clone(),
    );
    let vision_task = {
        let cancel = cancel.clone();
        let interval = config.vision.sample_interval();
        tokio::task::spawn_blocking(move || sampler.run(batch_tx, interval, cancel))
    };

    // Scoring, transport, fusion
    let scoring = ScoringResolver::new(&config.scoring.server_url, config.scoring.timeout())
        .context("Failed to build scoring client")?;
    let transport = RelayTransport::new(config.consumer.address(), config.consumer.retry_delay());
    let fusion = FusionLoop::new(
        FusionInputs {
            state_rx,
            batch_rx,
            log_rx,
        },
        scoring,
        match_key,
        transport,
        log,
        config.fusion.cadence(),
    );

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    fusion.run(cancel.clone()).await;

    if let Err(e) = telemetry_task.await {
        warn!("Telemetry task ended abnormally: {}", e);
    }
    if let Err(e) = vision_task.await {
        warn!("Vision thread ended abnormally: {}", e);
    }

    info!("skymark-relay shutdown complete");
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
