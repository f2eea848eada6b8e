//! Configuration loading
//!
//! Each service reads one TOML file. Every value has a compiled default, so
//! a missing file is a warning, not a failure. Config file resolution order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable `SKYMARK_CONFIG`
//! 3. `~/.config/skymark/<module>.toml`
//! 4. `/etc/skymark/<module>.toml`
//! 5. Compiled defaults (no file)
//!
//! Individual values may then be overridden from the command line by the
//! service binaries.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SKYMARK_CONFIG";

/// Locates a module's config file
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    module_name: String,
}

impl ConfigResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
        }
    }

    /// Resolve the config file path
    ///
    /// Explicit paths (CLI, environment) are returned even when they do not
    /// exist so the loader can report them; discovered paths only when they do.
    pub fn resolve(&self, cli_path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = cli_path {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        let file_name = format!("{}.toml", self.module_name);

        if let Some(user) = dirs::config_dir().map(|d| d.join("skymark").join(&file_name)) {
            if user.exists() {
                return Some(user);
            }
        }

        let system = PathBuf::from("/etc/skymark").join(&file_name);
        if system.exists() {
            return Some(system);
        }

        None
    }

    /// Resolve and load the module's config, falling back to defaults
    pub fn load<T: DeserializeOwned + Default>(&self, cli_path: Option<&Path>) -> Result<T> {
        match self.resolve(cli_path) {
            Some(path) => load_toml_file(&path),
            None => {
                warn!(
                    "No config file found for {}, using compiled defaults",
                    self.module_name
                );
                Ok(T::default())
            }
        }
    }
}

/// Read and parse one TOML config file
pub fn load_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {:?}: {}", path, e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse TOML {:?}: {}", path, e)))?;
    info!("Loaded configuration from {:?}", path);
    Ok(config)
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ========================================
// Relay configuration
// ========================================

/// Bootstrap configuration for skymark-relay
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Check values that have no usable default
    pub fn validate(&self) -> Result<()> {
        match self.scoring.match_key.as_deref() {
            Some(key) if !key.is_empty() => {}
            _ => {
                return Err(Error::Config(
                    "scoring.match_key is required (--match, SKYMARK_MATCH_KEY or [scoring] match_key)"
                        .to_string(),
                ))
            }
        }
        if self.consumer.host.trim().is_empty() {
            return Err(Error::Config("consumer.host must not be empty".to_string()));
        }
        if self.telemetry.stream_rate_hz == 0 {
            return Err(Error::Config("telemetry.stream_rate_hz must be positive".to_string()));
        }
        Ok(())
    }
}

/// Rendering consumer (relay transport target)
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_consumer_host")]
    pub host: String,
    #[serde(default = "default_consumer_port")]
    pub port: u16,
    #[serde(default = "default_consumer_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            host: default_consumer_host(),
            port: default_consumer_port(),
            retry_delay_ms: default_consumer_retry_delay_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_consumer_host() -> String {
    "127.0.0.1".to_string()
}

fn default_consumer_port() -> u16 {
    5065
}

fn default_consumer_retry_delay_ms() -> u64 {
    5000
}

/// Scoring authority client settings
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Session match key; required
    #[serde(default)]
    pub match_key: Option<String>,
    #[serde(default = "default_scoring_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            match_key: None,
            timeout_ms: default_scoring_timeout_ms(),
        }
    }
}

impl ScoringConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_scoring_timeout_ms() -> u64 {
    2000
}

/// How the telemetry side is selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryModeSetting {
    /// Try one live connect, fall back to synthetic data
    #[default]
    Auto,
    /// Live source only; retry forever
    Live,
    /// Synthetic generator only
    Synthetic,
}

impl FromStr for TelemetryModeSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "live" => Ok(Self::Live),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(Error::InvalidInput(format!(
                "Unknown telemetry mode '{}' (expected auto, live or synthetic)",
                other
            ))),
        }
    }
}

/// Telemetry link settings
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub mode: TelemetryModeSetting,
    /// MAVLink connection string
    #[serde(default = "default_telemetry_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on waiting for the first heartbeat
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_stream_rate_hz")]
    pub stream_rate_hz: u16,
    #[serde(default = "default_platform_id")]
    pub platform_id: u32,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            mode: TelemetryModeSetting::default(),
            endpoint: default_telemetry_endpoint(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stream_rate_hz: default_stream_rate_hz(),
            platform_id: default_platform_id(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl TelemetryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_telemetry_endpoint() -> String {
    "udpin:0.0.0.0:14550".to_string()
}

fn default_heartbeat_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_delay_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_stream_rate_hz() -> u16 {
    10
}

fn default_platform_id() -> u32 {
    1
}

fn default_log_capacity() -> usize {
    crate::platform::DEFAULT_STATUS_LOG_CAPACITY
}

/// Vision sampler settings
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    /// Directory of recorded frames; no camera when unset
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default = "default_vision_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            source: None,
            retry_delay_ms: default_vision_retry_delay_ms(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl VisionConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

fn default_vision_retry_delay_ms() -> u64 {
    5000
}

fn default_sample_interval_ms() -> u64 {
    50
}

/// Fusion loop cadence bounds, milliseconds
pub const MIN_CADENCE_MS: u64 = 50;
pub const MAX_CADENCE_MS: u64 = 500;

/// Fusion loop settings
#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            cadence_ms: default_cadence_ms(),
        }
    }
}

impl FusionConfig {
    /// Cycle period, clamped to the supported range
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms.clamp(MIN_CADENCE_MS, MAX_CADENCE_MS))
    }
}

fn default_cadence_ms() -> u64 {
    100
}

// ========================================
// Scorer configuration
// ========================================

/// Bootstrap configuration for skymark-scorer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScorerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub points: PointsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ScorerConfig {
    pub fn validate(&self) -> Result<()> {
        self.points.validate()
    }
}

/// HTTP bind settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    5000
}

/// Point-value generation for new matches
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PointsConfig {
    #[serde(default = "default_min_points")]
    pub min_points: i64,
    #[serde(default = "default_max_points")]
    pub max_points: i64,
    /// Probability that a tag becomes a penalty ("mine") tag
    #[serde(default = "default_penalty_chance")]
    pub penalty_chance: f64,
    #[serde(default = "default_penalty_value")]
    pub penalty_value: i64,
}

impl Default for PointsConfig {
    fn default() -> Self {
        Self {
            min_points: default_min_points(),
            max_points: default_max_points(),
            penalty_chance: default_penalty_chance(),
            penalty_value: default_penalty_value(),
        }
    }
}

impl PointsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_points > self.max_points {
            return Err(Error::Config(format!(
                "points.min_points ({}) exceeds points.max_points ({})",
                self.min_points, self.max_points
            )));
        }
        if !(0.0..=1.0).contains(&self.penalty_chance) {
            return Err(Error::Config(format!(
                "points.penalty_chance must be within 0.0..=1.0, got {}",
                self.penalty_chance
            )));
        }
        Ok(())
    }
}

fn default_min_points() -> i64 {
    5
}

fn default_max_points() -> i64 {
    50
}

fn default_penalty_chance() -> f64 {
    0.1
}

fn default_penalty_value() -> i64 {
    -45
}
