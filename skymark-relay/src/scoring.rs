//! Scoring resolver
//!
//! Stateless HTTP client for the scoring authority. Every call is bounded
//! by the client timeout; nothing is cached between calls.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use skymark_common::api::{DecodeResponse, VerifyResponse, DECODE_PATH, VERIFY_MATCH_KEY_PATH};
use tracing::debug;

use crate::error::ScoringError;
use crate::events::EventLog;

/// Opaque session identifier, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey(String);

impl MatchKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client for the scoring authority's decode and verify endpoints
#[derive(Debug, Clone)]
pub struct ScoringResolver {
    http_client: reqwest::Client,
    base_url: String,
}

impl ScoringResolver {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, ScoringError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScoringError::Unreachable(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: server_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask whether `key` names a registered match
    pub async fn verify_match_key(&self, key: &MatchKey) -> Result<bool, ScoringError> {
        let response = self
            .http_client
            .get(format!("{}{}", self.base_url, VERIFY_MATCH_KEY_PATH))
            .query(&[("match_key", key.as_str())])
            .send()
            .await
            .map_err(|e| ScoringError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::NOT_FOUND => {
                let body: VerifyResponse = response
                    .json()
                    .await
                    .map_err(|e| ScoringError::MalformedResponse(e.to_string()))?;
                Ok(body.valid)
            }
            status => Err(ScoringError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Point value of `marker_id` in match `key`
    ///
    /// 403 maps to [`ScoringError::InvalidMatchKey`], 404 to
    /// [`ScoringError::UnknownMarker`], timeouts and network failures to
    /// [`ScoringError::Unreachable`].
    pub async fn resolve(&self, marker_id: u32, key: &MatchKey) -> Result<i64, ScoringError> {
        let tag_id = marker_id.to_string();
        let response = self
            .http_client
            .get(format!("{}{}", self.base_url, DECODE_PATH))
            .query(&[("tag_id", tag_id.as_str()), ("match_key", key.as_str())])
            .send()
            .await
            .map_err(|e| ScoringError::Unreachable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body: DecodeResponse = response
                    .json()
                    .await
                    .map_err(|e| ScoringError::MalformedResponse(e.to_string()))?;
                debug!(marker_id, points = body.points, "Resolved marker");
                Ok(body.points)
            }
            StatusCode::FORBIDDEN => Err(ScoringError::InvalidMatchKey(key.to_string())),
            StatusCode::NOT_FOUND => Err(ScoringError::UnknownMarker(marker_id)),
            status => Err(ScoringError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Verify `key` once and report the outcome as a log event
    ///
    /// The outcome never stops the session; an invalid key only means later
    /// resolutions fail.
    pub async fn verify_and_report(&self, key: &MatchKey, log: &EventLog) -> bool {
        match self.verify_match_key(key).await {
            Ok(true) => {
                log.info(format!("Match key {} verified", key));
                true
            }
            Ok(false) => {
                log.error(format!("Invalid match_key: {}", key));
                false
            }
            Err(e) => {
                log.error(format!("Match key verification failed: {}", e));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let resolver = ScoringResolver::new("http://127.0.0.1:5000/", Duration::from_secs(2)).unwrap();
        assert_eq!(resolver.base_url(), "http://127.0.0.1:5000");
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let resolver =
            ScoringResolver::new(&format!("http://127.0.0.1:{}", port), Duration::from_millis(500))
                .unwrap();
        let key = MatchKey::new("M1");

        assert!(matches!(
            resolver.resolve(1, &key).await,
            Err(ScoringError::Unreachable(_))
        ));
        assert!(matches!(
            resolver.verify_match_key(&key).await,
            Err(ScoringError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_and_report_logs_unreachable_as_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let resolver =
            ScoringResolver::new(&format!("http://127.0.0.1:{}", port), Duration::from_millis(500))
                .unwrap();
        let (log, mut rx) = crate::events::channel(4);

        assert!(!resolver.verify_and_report(&MatchKey::new("M1"), &log).await);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.severity, skymark_common::Severity::Error);
        assert!(event.text.starts_with("Match key verification failed"));
    }
}
