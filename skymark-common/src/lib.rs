//! # Skymark Common Library
//!
//! Shared code for the skymark services:
//! - Platform State data model
//! - Outgoing relay messages (DRONE / TAG / LOG lines)
//! - Scoring authority request/response types
//! - Configuration loading
//! - Logging setup
//! - Time utilities

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod messages;
pub mod platform;
pub mod time;

pub use error::{Error, Result};
pub use messages::{OutgoingMessage, Severity};
pub use platform::PlatformState;
