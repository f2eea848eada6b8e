//! Per-component error types for skymark-relay
//!
//! None of these terminate the process; each is either retried by its
//! component or turned into a LOG message by the fusion loop.

use skymark_common::Severity;
use thiserror::Error;

/// Telemetry link errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// No heartbeat arrived within the connect timeout
    #[error("No heartbeat detected")]
    NoSourceDetected,

    /// The source could not be opened or went away
    #[error("Telemetry connection error: {0}")]
    Connection(String),

    #[error("Telemetry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Camera and detection errors
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Camera not available: {0}")]
    DeviceUnavailable(String),

    #[error("Camera is not open")]
    NotOpen,

    #[error("Frame capture failed: {0}")]
    Capture(String),

    #[error("Unsupported frame format: {0}")]
    Format(String),
}

/// Scoring outcomes other than a point value
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScoringError {
    /// 403 from the scoring authority
    #[error("Invalid match_key: {0}")]
    InvalidMatchKey(String),

    /// 404 from the scoring authority
    #[error("Unknown tag_id: {0}")]
    UnknownMarker(u32),

    /// Network failure or timeout
    #[error("Decoder server not reachable: {0}")]
    Unreachable(String),

    #[error("Unexpected response status {0}")]
    UnexpectedStatus(u16),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ScoringError {
    /// LOG severity used when this outcome is reported to the consumer
    pub fn severity(&self) -> Severity {
        match self {
            ScoringError::InvalidMatchKey(_) => Severity::Error,
            _ => Severity::Warning,
        }
    }
}

/// Relay transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected to consumer")]
    NotConnected,

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message encoding failed: {0}")]
    Encode(#[from] skymark_common::Error),
}
