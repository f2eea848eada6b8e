//! Telemetry link
//!
//! Owns the connection to a telemetry source and keeps the platform's
//! [`PlatformState`] current. The link walks
//! `Disconnected -> Connecting -> Connected -> (heartbeat timeout) -> Disconnected`;
//! on timeout the state is reset to all-unknown at once and the connection
//! is dropped. Reconnection is the caller's decision (see [`service`]).
//!
//! Sources are pluggable through [`TelemetrySource`]: the MAVLink source in
//! production, scripted doubles in tests.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skymark_common::config::TelemetryConfig;
use skymark_common::platform::{StatusText, PLATFORM_KIND_DRONE};
use skymark_common::{time, PlatformState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TelemetryError;

pub mod mavlink;
pub mod service;
pub mod synthetic;

pub use self::mavlink::MavlinkSource;
pub use service::TelemetryMode;
pub use synthetic::SyntheticGenerator;

/// Battery voltage reported when the cell voltage is unknown
pub const UNKNOWN_VOLTAGE_MV: u16 = u16::MAX;

/// Interval between polls while waiting for the first heartbeat
const HEARTBEAT_WAIT_POLL: Duration = Duration::from_millis(10);

/// One typed observation from the telemetry source
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Heartbeat { armed: bool, flight_mode: String },
    Position { x: f64, y: f64, z: f64 },
    Orientation { pitch: f64, roll: f64, yaw: f64 },
    /// Raw battery report; sentinels are resolved by [`apply_event`]
    Battery { voltage_mv: u16, remaining: i8 },
    Signal { rssi: u8 },
    StatusText { severity: u8, text: String },
}

impl TelemetryEvent {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, TelemetryEvent::Heartbeat { .. })
    }
}

/// Fold one event into the platform state
///
/// Only the fields the event carries are touched. Out-of-range battery
/// values (`u16::MAX` millivolts, percentage outside 0..=100) become unknown.
pub fn apply_event(state: &mut PlatformState, event: TelemetryEvent, now_ms: i64) {
    match event {
        TelemetryEvent::Heartbeat { armed, flight_mode } => {
            state.armed = Some(armed);
            state.armable = Some(true);
            state.flight_mode = Some(flight_mode);
        }
        TelemetryEvent::Position { x, y, z } => {
            state.x = Some(x);
            state.y = Some(y);
            state.z = Some(z);
        }
        TelemetryEvent::Orientation { pitch, roll, yaw } => {
            state.pitch = Some(pitch);
            state.roll = Some(roll);
            state.yaw = Some(yaw);
        }
        TelemetryEvent::Battery {
            voltage_mv,
            remaining,
        } => {
            state.battery_voltage = if voltage_mv == UNKNOWN_VOLTAGE_MV {
                None
            } else {
                Some(f64::from(voltage_mv) / 1000.0)
            };
            state.battery_percentage = u8::try_from(remaining).ok().filter(|p| *p <= 100);
        }
        TelemetryEvent::Signal { rssi } => {
            state.rssi = Some(rssi);
        }
        TelemetryEvent::StatusText { severity, text } => {
            state.messages.push(StatusText {
                severity,
                text,
                timestamp: now_ms,
            });
        }
    }
    state.touch(now_ms);
}

/// Opens connections to a telemetry source
///
/// `open` runs on the blocking thread pool and may block briefly.
pub trait TelemetrySource: Send + 'static {
    /// Human-readable endpoint for logs
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<Box<dyn TelemetryConnection>, TelemetryError>;
}

/// An open telemetry stream
pub trait TelemetryConnection: Send {
    /// Next pending event, without blocking
    ///
    /// An error means the connection is gone.
    fn try_recv(&mut self) -> Result<Option<TelemetryEvent>, TelemetryError>;

    /// Ask the source to stream all data at `rate_hz`
    fn request_streams(&mut self, rate_hz: u16) -> Result<(), TelemetryError>;
}

/// Link state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Timing and identity settings of a [`TelemetryLink`]
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub heartbeat_timeout: Duration,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub stream_rate_hz: u16,
    pub platform_id: u32,
    pub log_capacity: usize,
}

impl From<&TelemetryConfig> for LinkSettings {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            stream_rate_hz: config.stream_rate_hz,
            platform_id: config.platform_id,
            log_capacity: config.log_capacity,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&TelemetryConfig::default())
    }
}

/// Live link to a telemetry source
pub struct TelemetryLink {
    source: Arc<Mutex<Box<dyn TelemetrySource>>>,
    endpoint: String,
    connection: Option<Box<dyn TelemetryConnection>>,
    settings: LinkSettings,
    state: PlatformState,
    link_state: LinkState,
    last_heartbeat: Option<Instant>,
}

impl TelemetryLink {
    pub fn new(source: Box<dyn TelemetrySource>, settings: LinkSettings) -> Self {
        let endpoint = source.describe();
        Self {
            source: Arc::new(Mutex::new(source)),
            endpoint,
            connection: None,
            state: PlatformState::unknown(settings.log_capacity),
            settings,
            link_state: LinkState::Disconnected,
            last_heartbeat: None,
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current platform state
    pub fn state(&self) -> &PlatformState {
        &self.state
    }

    /// Open the source and wait for its first heartbeat
    ///
    /// Events other than heartbeats are discarded while waiting. On success
    /// the source is asked to stream at the configured rate and the liveness
    /// timer starts. Does not retry.
    pub async fn connect(&mut self) -> Result<(), TelemetryError> {
        self.link_state = LinkState::Connecting;
        debug!("Opening telemetry source {}", self.endpoint);

        let source = Arc::clone(&self.source);
        let opened = tokio::task::spawn_blocking(move || match source.lock() {
            Ok(mut source) => source.open(),
            Err(_) => Err(TelemetryError::Connection(
                "telemetry source lock poisoned".to_string(),
            )),
        })
        .await
        .map_err(|e| TelemetryError::Connection(e.to_string()))
        .and_then(|result| result);

        let mut connection = match opened {
            Ok(connection) => connection,
            Err(e) => {
                self.link_state = LinkState::Disconnected;
                return Err(e);
            }
        };

        let deadline = Instant::now() + self.settings.connect_timeout;
        let heartbeat = loop {
            match connection.try_recv() {
                Ok(Some(event)) if event.is_heartbeat() => break event,
                Ok(Some(_)) => continue,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        self.link_state = LinkState::Disconnected;
                        return Err(TelemetryError::NoSourceDetected);
                    }
                    tokio::time::sleep(HEARTBEAT_WAIT_POLL).await;
                }
                Err(e) => {
                    self.link_state = LinkState::Disconnected;
                    return Err(e);
                }
            }
        };

        if let Err(e) = connection.request_streams(self.settings.stream_rate_hz) {
            warn!("Stream request to {} failed: {}", self.endpoint, e);
        }

        self.state
            .set_identity(PLATFORM_KIND_DRONE, self.settings.platform_id);
        apply_event(&mut self.state, heartbeat, time::now_millis());
        self.last_heartbeat = Some(Instant::now());
        self.connection = Some(connection);
        self.link_state = LinkState::Connected;
        info!("Telemetry connected on {}", self.endpoint);
        Ok(())
    }

    /// Take at most one pending event and fold it into the state
    ///
    /// Never blocks. A connection error drops the link immediately.
    pub fn poll(&mut self) -> Option<TelemetryEvent> {
        let connection = self.connection.as_mut()?;
        match connection.try_recv() {
            Ok(Some(event)) => {
                if event.is_heartbeat() {
                    self.last_heartbeat = Some(Instant::now());
                    self.state
                        .set_identity(PLATFORM_KIND_DRONE, self.settings.platform_id);
                }
                apply_event(&mut self.state, event.clone(), time::now_millis());
                Some(event)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Telemetry connection lost: {}", e);
                self.drop_link();
                None
            }
        }
    }

    /// Apply the heartbeat timeout as of `now`
    ///
    /// Returns true when the link was just declared lost.
    pub fn check_liveness_at(&mut self, now: Instant) -> bool {
        if self.link_state != LinkState::Connected {
            return false;
        }
        match self.last_heartbeat {
            Some(last) if now.saturating_duration_since(last) < self.settings.heartbeat_timeout => {
                false
            }
            _ => {
                self.drop_link();
                true
            }
        }
    }

    pub fn check_liveness(&mut self) -> bool {
        self.check_liveness_at(Instant::now())
    }

    /// Retry [`connect`](Self::connect) on the reconnect delay until it
    /// succeeds; false when cancelled first
    pub async fn reconnect(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.connect().await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(
                        "Reconnect to {} failed: {}; retrying in {:?}",
                        self.endpoint, e, self.settings.reconnect_delay
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
    }

    /// Forget everything and tear the connection down
    fn drop_link(&mut self) {
        self.connection = None;
        self.last_heartbeat = None;
        self.state.reset();
        self.link_state = LinkState::Disconnected;
    }
}
