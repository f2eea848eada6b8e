//! Configuration resolution and loading tests
//!
//! Tests that manipulate SKYMARK_CONFIG are marked with #[serial] so they
//! never race each other.

use std::env;
use std::io::Write;

use serial_test::serial;
use skymark_common::config::{ConfigResolver, RelayConfig, ScorerConfig, CONFIG_ENV_VAR};
use skymark_common::Error;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[test]
#[serial]
fn test_cli_path_beats_environment() {
    let cli = write_config("[consumer]\nport = 7001\n");
    let envfile = write_config("[consumer]\nport = 7002\n");
    env::set_var(CONFIG_ENV_VAR, envfile.path());

    let resolver = ConfigResolver::new("relay");
    let config: RelayConfig = resolver.load(Some(cli.path())).unwrap();
    assert_eq!(config.consumer.port, 7001);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_environment_path_used_without_cli() {
    let envfile = write_config("[server]\nport = 5999\n\n[points]\npenalty_value = -10\n");
    env::set_var(CONFIG_ENV_VAR, envfile.path());

    let config: ScorerConfig = ConfigResolver::new("scorer").load(None).unwrap();
    assert_eq!(config.server.port, 5999);
    assert_eq!(config.points.penalty_value, -10);
    assert_eq!(config.points.min_points, 5);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_explicit_missing_file_is_config_error() {
    env::remove_var(CONFIG_ENV_VAR);
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let result: Result<RelayConfig, _> = ConfigResolver::new("relay").load(Some(&missing));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_malformed_toml_is_config_error() {
    env::remove_var(CONFIG_ENV_VAR);
    let bad = write_config("[consumer\nport = ");
    let result: Result<RelayConfig, _> = ConfigResolver::new("relay").load(Some(bad.path()));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_full_relay_file() {
    let file = write_config(
        r#"
        [consumer]
        host = "10.0.0.5"
        port = 5065
        retry_delay_ms = 2000

        [scoring]
        server_url = "http://10.0.0.2:5000"
        match_key = "FINALS"
        timeout_ms = 1500

        [telemetry]
        mode = "live"
        endpoint = "tcpout:10.0.0.9:5760"
        heartbeat_timeout_ms = 1000

        [vision]
        source = "/var/lib/skymark/frames"
        retry_delay_ms = 5000

        [fusion]
        cadence_ms = 50

        [logging]
        level = "debug"
        "#,
    );

    let config: RelayConfig = skymark_common::config::load_toml_file(file.path()).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.consumer.address(), "10.0.0.5:5065");
    assert_eq!(config.scoring.match_key.as_deref(), Some("FINALS"));
    assert_eq!(config.telemetry.endpoint, "tcpout:10.0.0.9:5760");
    assert_eq!(
        config.vision.source.as_deref(),
        Some(std::path::Path::new("/var/lib/skymark/frames"))
    );
    assert_eq!(config.logging.level, "debug");
}
