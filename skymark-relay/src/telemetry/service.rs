//! Telemetry task
//!
//! The telemetry side runs in exactly one of two modes, chosen once at
//! startup: a live [`TelemetryLink`] or a [`SyntheticGenerator`]. Either way
//! the task is the only writer of the platform state and publishes snapshots
//! through a single-slot `watch` channel.

use std::time::Duration;

use skymark_common::config::TelemetryModeSetting;
use skymark_common::{time, PlatformState};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{LinkState, SyntheticGenerator, TelemetryLink};
use crate::events::EventLog;

/// How often the live link is polled
pub const LIVE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often a synthetic state is produced
pub const SYNTHETIC_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on events folded in per poll tick
const MAX_EVENTS_PER_TICK: usize = 256;

/// Telemetry mode selected at session start
pub enum TelemetryMode {
    Live(TelemetryLink),
    Synthetic(SyntheticGenerator),
}

impl TelemetryMode {
    /// Pick the mode for this session
    ///
    /// `Auto` tries one live connect and falls back to synthetic data;
    /// `Live` waits for a source indefinitely (until cancelled).
    pub async fn select(
        setting: TelemetryModeSetting,
        mut link: TelemetryLink,
        generator: SyntheticGenerator,
        log: &EventLog,
        cancel: &CancellationToken,
    ) -> Self {
        match setting {
            TelemetryModeSetting::Synthetic => {
                log.info("Telemetry disabled. Sending synthetic drone data.");
                TelemetryMode::Synthetic(generator)
            }
            TelemetryModeSetting::Auto => match link.connect().await {
                Ok(()) => {
                    log.info(format!("Drone connected on {}", link.endpoint()));
                    TelemetryMode::Live(link)
                }
                Err(e) => {
                    info!("Telemetry unavailable on {}: {}", link.endpoint(), e);
                    log.warn("No heartbeat detected. Will send dummy drone data.");
                    TelemetryMode::Synthetic(generator)
                }
            },
            TelemetryModeSetting::Live => {
                log.info(format!("Waiting for drone heartbeat on {}", link.endpoint()));
                if link.reconnect(cancel).await {
                    log.info(format!("Drone connected on {}", link.endpoint()));
                }
                TelemetryMode::Live(link)
            }
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, TelemetryMode::Synthetic(_))
    }

    /// Publish platform state until cancelled
    pub async fn run(
        self,
        tx: watch::Sender<PlatformState>,
        log: EventLog,
        cancel: CancellationToken,
    ) {
        match self {
            TelemetryMode::Live(link) => run_live(link, tx, log, cancel).await,
            TelemetryMode::Synthetic(generator) => run_synthetic(generator, tx, cancel).await,
        }
        info!("Telemetry task stopped");
    }
}

/// Publish the live link's state until cancelled
///
/// The channel holds only the latest snapshot. The all-unknown state
/// published on link loss stays visible while reconnecting, but a reconnect
/// that completes within one fusion cadence can replace it before it is
/// sampled. Every loss is also reported as a "Drone disconnected!" event.
async fn run_live(
    mut link: TelemetryLink,
    tx: watch::Sender<PlatformState>,
    log: EventLog,
    cancel: CancellationToken,
) {
    tx.send_replace(link.state().clone());

    let mut ticker = tokio::time::interval(LIVE_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut changed = false;
        for _ in 0..MAX_EVENTS_PER_TICK {
            if link.poll().is_none() {
                break;
            }
            changed = true;
        }

        let lost = link.check_liveness() || link.link_state() == LinkState::Disconnected;
        if changed || lost {
            tx.send_replace(link.state().clone());
        }

        if lost {
            log.warn("Drone disconnected!");
            if !link.reconnect(&cancel).await {
                break;
            }
            log.info("Drone reconnected!");
            tx.send_replace(link.state().clone());
        }
    }
}

async fn run_synthetic(
    mut generator: SyntheticGenerator,
    tx: watch::Sender<PlatformState>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SYNTHETIC_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tx.send_replace(generator.sample(time::now_millis()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::telemetry::testing::*;
    use crate::telemetry::synthetic::SYNTHETIC_FLIGHT_MODE;
    use crate::telemetry::{TelemetryEvent, TelemetryLink};

    fn link_for(script: &Script) -> TelemetryLink {
        TelemetryLink::new(Box::new(ScriptedSource(script.clone())), fast_settings())
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_synthetic() {
        let script = Script::default();
        let (log, mut log_rx) = events::channel(16);
        let cancel = CancellationToken::new();

        let mode = TelemetryMode::select(
            TelemetryModeSetting::Auto,
            link_for(&script),
            SyntheticGenerator::with_seed(1, 1, 8),
            &log,
            &cancel,
        )
        .await;

        assert!(mode.is_synthetic());
        let event = log_rx.recv().await.unwrap();
        assert_eq!(event.text, "No heartbeat detected. Will send dummy drone data.");
    }

    #[tokio::test]
    async fn test_auto_selects_live_when_heartbeat_arrives() {
        let script = Script::default();
        script.set_available(true);
        script.push(heartbeat());
        let (log, _log_rx) = events::channel(16);
        let cancel = CancellationToken::new();

        let mode = TelemetryMode::select(
            TelemetryModeSetting::Auto,
            link_for(&script),
            SyntheticGenerator::with_seed(1, 1, 8),
            &log,
            &cancel,
        )
        .await;
        assert!(!mode.is_synthetic());
    }

    #[tokio::test]
    async fn test_synthetic_mode_publishes_states() {
        let (log, _log_rx) = events::channel(16);
        let cancel = CancellationToken::new();
        let mode = TelemetryMode::Synthetic(SyntheticGenerator::with_seed(3, 1, 8));
        let (tx, mut rx) = watch::channel(PlatformState::unknown(8));

        let task = tokio::spawn(mode.run(tx, log, cancel.clone()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().flight_mode.as_deref(), Some(SYNTHETIC_FLIGHT_MODE));
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_live_mode_resets_on_silence_and_reconnects() {
        let script = Script::default();
        script.set_available(true);
        script.push(heartbeat());
        let mut link = link_for(&script);
        link.connect().await.unwrap();

        script.push(TelemetryEvent::Position {
            x: 1.0,
            y: 2.0,
            z: 3.0,
        });

        let (log, mut log_rx) = events::channel(64);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = watch::channel(PlatformState::unknown(8));
        let task = tokio::spawn(TelemetryMode::Live(link).run(tx, log, cancel.clone()));

        // Position observed
        loop {
            rx.changed().await.unwrap();
            if rx.borrow().x == Some(1.0) {
                break;
            }
        }

        // Source goes silent and unreachable: state resets after the timeout
        script.set_available(false);
        loop {
            rx.changed().await.unwrap();
            if rx.borrow().is_unknown() {
                break;
            }
        }
        let lost = log_rx.recv().await.unwrap();
        assert_eq!(lost.text, "Drone disconnected!");

        // Source returns
        script.push(heartbeat());
        script.set_available(true);
        loop {
            rx.changed().await.unwrap();
            if rx.borrow().platform.as_deref() == Some("DRONE") {
                break;
            }
        }
        let back = log_rx.recv().await.unwrap();
        assert_eq!(back.text, "Drone reconnected!");

        cancel.cancel();
        task.await.unwrap();
    }
}
