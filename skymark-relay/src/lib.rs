//! skymark-relay library - Fusion and relay engine
//!
//! Streams the tracked platform's state and the markers its camera sees to
//! a rendering consumer, scoring each marker against the active match.
//!
//! Components, each failing and recovering on its own:
//! - [`telemetry`]: live platform link with synthetic fallback
//! - [`vision`]: camera sampling and marker detection
//! - [`scoring`]: remote point lookups
//! - [`transport`]: line-oriented consumer connection
//! - [`fusion`]: per-cycle orchestration of all of the above

pub mod error;
pub mod events;
pub mod fusion;
pub mod scoring;
pub mod telemetry;
pub mod transport;
pub mod vision;

pub use error::{ScoringError, TelemetryError, TransportError, VisionError};
pub use events::EventLog;
pub use fusion::FusionLoop;
pub use scoring::{MatchKey, ScoringResolver};
pub use transport::RelayTransport;
