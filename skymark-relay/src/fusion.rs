//! Fusion loop
//!
//! Runs on a fixed cadence. Each cycle:
//! 1. Make sure the consumer is connected (reconnecting blocks only this loop)
//! 2. Take the latest platform state; queue a DRONE message if it changed
//! 3. Take the latest detection batch, if newer than the last one used;
//!    resolve every marker concurrently and queue TAG messages in detection order
//! 4. Send the queue in order; a failed write aborts the cycle and forces a
//!    reconnect before anything else is sent
//! 5. Forward pending log events best-effort
//!
//! Telemetry, vision and scoring only feed this loop; a failure in one of
//! them never stops the others from producing output.

use std::time::Duration;

use futures::future::join_all;
use skymark_common::messages::{LogMessage, MarkerEventMessage};
use skymark_common::{time, OutgoingMessage, PlatformState};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::events::EventLog;
use crate::scoring::{MatchKey, ScoringResolver};
use crate::transport::RelayTransport;
use crate::vision::{world_position, DetectionBatch};

/// Channels feeding the fusion loop
pub struct FusionInputs {
    pub state_rx: watch::Receiver<PlatformState>,
    pub batch_rx: watch::Receiver<Option<DetectionBatch>>,
    pub log_rx: mpsc::Receiver<LogMessage>,
}

/// Per-cycle orchestrator
pub struct FusionLoop {
    inputs: FusionInputs,
    resolver: ScoringResolver,
    match_key: MatchKey,
    transport: RelayTransport,
    log: EventLog,
    cadence: Duration,
    /// Timestamp of the last platform state sent; `None` forces a resend
    last_state_timestamp: Option<Option<i64>>,
    last_batch_sequence: Option<u64>,
    match_key_checked: bool,
}

impl FusionLoop {
    pub fn new(
        inputs: FusionInputs,
        resolver: ScoringResolver,
        match_key: MatchKey,
        transport: RelayTransport,
        log: EventLog,
        cadence: Duration,
    ) -> Self {
        Self {
            inputs,
            resolver,
            match_key,
            transport,
            log,
            cadence,
            last_state_timestamp: None,
            last_batch_sequence: None,
            match_key_checked: false,
        }
    }

    pub fn transport(&self) -> &RelayTransport {
        &self.transport
    }

    /// Run cycles until cancelled, then close the consumer connection
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Fusion loop running every {:?}", self.cadence);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let keep_going = tokio::select! {
                _ = cancel.cancelled() => false,
                running = self.run_cycle(&cancel) => running,
            };
            if !keep_going {
                break;
            }
        }

        self.transport.disconnect();
        info!("Fusion loop stopped");
    }

    /// One full cycle; false when cancelled while reconnecting
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> bool {
        if !self.transport.is_connected() && !self.reconnect(cancel).await {
            return false;
        }

        let messages = self.collect_cycle().await;
        for message in &messages {
            match self.transport.send(message).await {
                Ok(()) => {}
                Err(TransportError::Encode(e)) => {
                    self.log
                        .error(format!("Dropped unencodable {} message: {}", message.kind(), e));
                }
                Err(e) => {
                    warn!("Relay transport down ({}); reconnecting before next send", e);
                    return true;
                }
            }
        }

        self.flush_logs().await;
        true
    }

    /// Build this cycle's DRONE and TAG messages, in send order
    pub async fn collect_cycle(&mut self) -> Vec<OutgoingMessage> {
        let now = time::now_millis();
        let state = self.inputs.state_rx.borrow().clone();
        let mut messages = Vec::new();

        if self.last_state_timestamp != Some(state.timestamp) {
            self.last_state_timestamp = Some(state.timestamp);
            messages.push(OutgoingMessage::platform_state(state.clone(), now));
        }

        let batch = {
            let latest = self.inputs.batch_rx.borrow();
            latest
                .as_ref()
                .filter(|b| Some(b.sequence) != self.last_batch_sequence)
                .cloned()
        };
        let Some(batch) = batch else {
            return messages;
        };
        self.last_batch_sequence = Some(batch.sequence);

        let resolver = &self.resolver;
        let match_key = &self.match_key;
        let outcomes = join_all(
            batch
                .detections
                .iter()
                .map(|d| resolver.resolve(d.marker_id, match_key)),
        )
        .await;

        for (detection, outcome) in batch.detections.iter().zip(outcomes) {
            let points = match outcome {
                Ok(points) => {
                    self.log.info(format!(
                        "Tag {} decoded successfully: {} points",
                        detection.marker_id, points
                    ));
                    points
                }
                Err(e) => {
                    self.log.emit(e.severity(), e.to_string());
                    0
                }
            };
            let world = world_position(&state, detection.center);
            messages.push(OutgoingMessage::MarkerEvent(MarkerEventMessage {
                id: detection.marker_id,
                x: world.x,
                y: world.y,
                z: world.z,
                points,
                timestamp: now,
            }));
        }

        messages
    }

    async fn reconnect(&mut self, cancel: &CancellationToken) -> bool {
        if !self.transport.connect(cancel).await {
            return false;
        }

        // Startup events are kept for the first connection; anything queued
        // during a later outage is stale
        if self.match_key_checked {
            let mut stale = 0usize;
            while self.inputs.log_rx.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!("Discarded {} log events from the outage", stale);
            }
        }

        // The consumer has no state from before the reconnect
        self.last_state_timestamp = None;
        self.log
            .info(format!("Connected to consumer at {}", self.transport.address()));

        if !self.match_key_checked {
            self.match_key_checked = true;
            self.resolver
                .verify_and_report(&self.match_key, &self.log)
                .await;
        }
        true
    }

    async fn flush_logs(&mut self) {
        while self.transport.is_connected() {
            let Ok(event) = self.inputs.log_rx.try_recv() else {
                break;
            };
            self.transport
                .send_best_effort(&OutgoingMessage::Log(event))
                .await;
        }
    }
}
