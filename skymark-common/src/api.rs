//! Scoring authority request/response types
//!
//! Shared between the scoring service (skymark-scorer) and its clients
//! (skymark-relay's resolver, skymark-admin).
//!
//! | Endpoint | Method | Request | Response |
//! |---|---|---|---|
//! | `/new_match` | POST | [`NewMatchRequest`] | [`NewMatchResponse`] |
//! | `/decode` | GET | [`DecodeQuery`] | [`DecodeResponse`] |
//! | `/verify_match_key` | GET | [`VerifyQuery`] | [`VerifyResponse`] |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const NEW_MATCH_PATH: &str = "/new_match";
pub const DECODE_PATH: &str = "/decode";
pub const VERIFY_MATCH_KEY_PATH: &str = "/verify_match_key";
pub const HEALTH_PATH: &str = "/health";

/// Body of `POST /new_match`
///
/// Fields are optional so the service can answer 400 for missing fields
/// instead of rejecting the body outright.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMatchRequest {
    #[serde(default)]
    pub match_key: Option<String>,
    #[serde(default)]
    pub tag_ids: Option<Vec<String>>,
}

/// Response of `POST /new_match`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMatchResponse {
    pub match_key: String,
    /// tag id -> points
    pub mapping: BTreeMap<String, i64>,
    pub tag_count: usize,
}

/// Query of `GET /decode`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodeQuery {
    #[serde(default)]
    pub tag_id: Option<String>,
    #[serde(default)]
    pub match_key: Option<String>,
}

/// Response of `GET /decode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeResponse {
    pub tag_id: String,
    pub points: i64,
}

/// Query of `GET /verify_match_key`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub match_key: Option<String>,
}

/// Response of `GET /verify_match_key` (200 when valid, 404 when not)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

/// Error body for every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
}
