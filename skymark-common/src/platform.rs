//! Platform State data model
//!
//! The current best-known pose and health of the tracked platform. Every
//! field is `None` ("unknown") until a real observation sets it, and is
//! serialized as JSON `null` so consumers never mistake unknown for zero.

use std::collections::VecDeque;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identity type tag reported for drones
pub const PLATFORM_KIND_DRONE: &str = "DRONE";

/// Default capacity of the status text ring buffer
pub const DEFAULT_STATUS_LOG_CAPACITY: usize = 32;

/// One free-text status message reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusText {
    /// Source severity (MAVLink scale: 0 = emergency .. 7 = debug)
    pub severity: u8,
    pub text: String,
    /// Receive time, epoch milliseconds
    pub timestamp: i64,
}

/// Fixed-capacity log of recent status messages
///
/// Pushing past capacity evicts the oldest entry. Serialized as a plain
/// JSON array, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLog {
    entries: VecDeque<StatusText>,
    capacity: usize,
}

impl StatusLog {
    /// Create an empty log holding at most `capacity` entries (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, dropping the oldest one when full
    pub fn push(&mut self, entry: StatusText) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &StatusText> {
        self.entries.iter()
    }
}

impl Default for StatusLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_STATUS_LOG_CAPACITY)
    }
}

impl Serialize for StatusLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

impl<'de> Deserialize<'de> for StatusLog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<StatusText>::deserialize(deserializer)?;
        let mut log = StatusLog::with_capacity(items.len().max(DEFAULT_STATUS_LOG_CAPACITY));
        for item in items {
            log.push(item);
        }
        Ok(log)
    }
}

/// Current best-known pose and health of the tracked platform
///
/// Exclusively mutated by the telemetry side; everyone else reads clones.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlatformState {
    /// Identity type tag (e.g. `DRONE`)
    pub platform: Option<String>,
    /// Identity numeric id
    pub id: Option<u32>,

    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,

    /// Radians
    pub pitch: Option<f64>,
    pub roll: Option<f64>,
    pub yaw: Option<f64>,

    /// Last observation time, epoch milliseconds. Carried on the wire as
    /// the message timestamp rather than as a payload field.
    #[serde(skip)]
    pub timestamp: Option<i64>,

    pub armable: Option<bool>,
    pub armed: Option<bool>,

    /// Volts
    pub battery_voltage: Option<f64>,
    /// 0..=100
    pub battery_percentage: Option<u8>,

    pub flight_mode: Option<String>,
    pub rssi: Option<u8>,

    pub messages: StatusLog,
}

impl PlatformState {
    /// All-unknown state whose status log holds up to `log_capacity` entries
    pub fn unknown(log_capacity: usize) -> Self {
        Self {
            messages: StatusLog::with_capacity(log_capacity),
            ..Self::default()
        }
    }

    /// Forget every observation, keeping the status log capacity
    pub fn reset(&mut self) {
        *self = Self::unknown(self.messages.capacity());
    }

    /// Set identity fields
    pub fn set_identity(&mut self, kind: &str, id: u32) {
        self.platform = Some(kind.to_string());
        self.id = Some(id);
    }

    /// Advance the observation timestamp; never moves backwards
    pub fn touch(&mut self, now_ms: i64) {
        self.timestamp = Some(match self.timestamp {
            Some(prev) if prev > now_ms => prev,
            _ => now_ms,
        });
    }

    /// True when no field has been observed since the last reset
    pub fn is_unknown(&self) -> bool {
        self.platform.is_none()
            && self.id.is_none()
            && self.x.is_none()
            && self.y.is_none()
            && self.z.is_none()
            && self.pitch.is_none()
            && self.roll.is_none()
            && self.yaw.is_none()
            && self.timestamp.is_none()
            && self.armable.is_none()
            && self.armed.is_none()
            && self.battery_voltage.is_none()
            && self.battery_percentage.is_none()
            && self.flight_mode.is_none()
            && self.rssi.is_none()
            && self.messages.is_empty()
    }
}
