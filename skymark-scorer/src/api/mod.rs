//! HTTP API handlers for skymark-scorer

pub mod health;
pub mod matches;

pub use health::health_routes;
pub use matches::{decode, match_routes, new_match, verify_match_key};
