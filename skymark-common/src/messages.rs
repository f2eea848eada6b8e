//! Outgoing relay messages
//!
//! The relay protocol is newline-delimited JSON: one object per line with a
//! `type` discriminator (`DRONE` | `TAG` | `LOG`) and an integer millisecond
//! `timestamp`. No framing beyond the newline, no acknowledgement.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::platform::PlatformState;
use crate::Result;

/// Severity carried by LOG messages
///
/// Encoded on the wire as the consumer's integer codes: 1 = error,
/// 2 = warning, 3 = info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn code(self) -> u8 {
        match self {
            Severity::Error => 1,
            Severity::Warning => 2,
            Severity::Info => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Severity::Error),
            2 => Some(Severity::Warning),
            3 => Some(Severity::Info),
            _ => None,
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Severity::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown severity code {}", code)))
    }
}

/// Platform pose/health snapshot (`DRONE`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformStateMessage {
    #[serde(flatten)]
    pub state: PlatformState,
    pub timestamp: i64,
}

/// One scored marker in world coordinates (`TAG`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerEventMessage {
    /// Marker id
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Resolved point value; 0 when scoring failed
    pub points: i64,
    pub timestamp: i64,
}

/// Human-readable condition report (`LOG`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub severity: Severity,
    pub text: String,
    pub timestamp: i64,
}

/// Unit sent over the relay transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutgoingMessage {
    #[serde(rename = "DRONE")]
    PlatformState(PlatformStateMessage),
    #[serde(rename = "TAG")]
    MarkerEvent(MarkerEventMessage),
    #[serde(rename = "LOG")]
    Log(LogMessage),
}

impl OutgoingMessage {
    /// Build a DRONE message. Uses the state's own timestamp when known,
    /// `fallback_ms` otherwise (e.g. right after a reset to unknown).
    pub fn platform_state(state: PlatformState, fallback_ms: i64) -> Self {
        let timestamp = state.timestamp.unwrap_or(fallback_ms);
        OutgoingMessage::PlatformState(PlatformStateMessage { state, timestamp })
    }

    pub fn log(severity: Severity, text: impl Into<String>, timestamp: i64) -> Self {
        OutgoingMessage::Log(LogMessage {
            severity,
            text: text.into(),
            timestamp,
        })
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            OutgoingMessage::PlatformState(m) => m.timestamp,
            OutgoingMessage::MarkerEvent(m) => m.timestamp,
            OutgoingMessage::Log(m) => m.timestamp,
        }
    }

    /// Wire discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::PlatformState(_) => "DRONE",
            OutgoingMessage::MarkerEvent(_) => "TAG",
            OutgoingMessage::Log(_) => "LOG",
        }
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
