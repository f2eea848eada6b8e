//! End-to-end tests for the relay engine
//!
//! Each test stands up an in-process scoring authority on an ephemeral port
//! and a TCP listener playing the rendering consumer.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use skymark_common::api::{NewMatchRequest, NewMatchResponse};
use skymark_common::PlatformState;
use skymark_relay::events::{self, EventLog};
use skymark_relay::fusion::{FusionInputs, FusionLoop};
use skymark_relay::telemetry::{SyntheticGenerator, TelemetryMode};
use skymark_relay::vision::{
    Camera, Detection, DetectionBatch, GrayFrame, MarkerDetector, NormalizedPoint,
    RecordedDetector, ReplayCamera, VisionSampler,
};
use skymark_relay::{MatchKey, RelayTransport, ScoringError, ScoringResolver, VisionError};
use skymark_scorer::{build_router, AppState, PointsPolicy};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

/// Serve a fresh scoring authority; returns its base URL
async fn spawn_scorer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::new(PointsPolicy::default()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// URL on which nothing listens
fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    format!("http://{}", listener.local_addr().unwrap())
}

async fn create_match(server: &str, key: &str, tag_ids: &[&str]) -> BTreeMap<String, i64> {
    let request = NewMatchRequest {
        match_key: Some(key.to_string()),
        tag_ids: Some(tag_ids.iter().map(|s| s.to_string()).collect()),
    };
    let response: NewMatchResponse = reqwest::Client::new()
        .post(format!("{}/new_match", server))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    response.mapping
}

fn resolver(server: &str) -> ScoringResolver {
    ScoringResolver::new(server, Duration::from_secs(2)).unwrap()
}

async fn next_json(lines: &mut Lines<BufReader<TcpStream>>) -> Value {
    let line = tokio::time::timeout(READ_TIMEOUT, lines.next_line())
        .await
        .expect("consumer read timed out")
        .expect("consumer read failed")
        .expect("relay closed the stream");
    serde_json::from_str(&line).expect("line is JSON")
}

/// Read lines until one matches, failing after `limit` lines
async fn read_until(
    lines: &mut Lines<BufReader<TcpStream>>,
    limit: usize,
    mut wanted: impl FnMut(&Value) -> bool,
) -> Vec<Value> {
    let mut seen = Vec::new();
    for _ in 0..limit {
        let value = next_json(lines).await;
        let done = wanted(&value);
        seen.push(value);
        if done {
            return seen;
        }
    }
    panic!("no matching line in {} lines: {:?}", limit, seen);
}

struct Relay {
    cancel: CancellationToken,
    fusion: tokio::task::JoinHandle<()>,
}

impl Relay {
    async fn stop(self) {
        self.cancel.cancel();
        self.fusion.await.unwrap();
    }
}

/// Start a fusion loop towards `consumer` with the given inputs
fn start_fusion(
    consumer: &str,
    server: &str,
    key: &str,
    inputs: FusionInputs,
    log: EventLog,
    cancel: CancellationToken,
) -> Relay {
    let fusion = FusionLoop::new(
        inputs,
        ScoringResolver::new(server, Duration::from_millis(500)).unwrap(),
        MatchKey::new(key),
        RelayTransport::new(consumer, Duration::from_millis(20)),
        log,
        Duration::from_millis(50),
    );
    let handle = tokio::spawn(fusion.run(cancel.clone()));
    Relay {
        cancel,
        fusion: handle,
    }
}

fn platform_at(x: f64, y: f64, timestamp: i64) -> PlatformState {
    let mut state = PlatformState::unknown(8);
    state.set_identity("DRONE", 1);
    state.x = Some(x);
    state.y = Some(y);
    state.z = Some(5.0);
    state.touch(timestamp);
    state
}

fn write_frame(dir: &Path, name: &str, sidecar: &str) {
    let mut bytes = b"P5\n64 48\n255\n".to_vec();
    bytes.extend(std::iter::repeat(0u8).take(64 * 48));
    std::fs::write(dir.join(format!("{}.pgm", name)), bytes).unwrap();
    std::fs::write(dir.join(format!("{}.json", name)), sidecar).unwrap();
}

// =============================================================================
// Scoring resolver against the real scoring authority
// =============================================================================

#[tokio::test]
async fn test_resolver_match_scenario() {
    let server = spawn_scorer().await;
    let mapping = create_match(&server, "M1", &["1", "2"]).await;
    let resolver = resolver(&server);
    let m1 = MatchKey::new("M1");

    let first = resolver.resolve(1, &m1).await.unwrap();
    let second = resolver.resolve(1, &m1).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, mapping["1"]);

    assert_eq!(
        resolver.resolve(3, &m1).await,
        Err(ScoringError::UnknownMarker(3))
    );
    assert!(matches!(
        resolver.resolve(1, &MatchKey::new("M2")).await,
        Err(ScoringError::InvalidMatchKey(_))
    ));
}

#[tokio::test]
async fn test_resolver_round_trip_every_tag() {
    let server = spawn_scorer().await;
    let ids: Vec<String> = (1..=40).map(|i| i.to_string()).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mapping = create_match(&server, "ROUND", &id_refs).await;
    let resolver = resolver(&server);
    let key = MatchKey::new("ROUND");

    for (tag_id, points) in &mapping {
        let marker: u32 = tag_id.parse().unwrap();
        assert_eq!(resolver.resolve(marker, &key).await.unwrap(), *points);
    }
}

#[tokio::test]
async fn test_verify_match_key() {
    let server = spawn_scorer().await;
    create_match(&server, "M1", &["1"]).await;
    let resolver = resolver(&server);

    assert!(resolver.verify_match_key(&MatchKey::new("M1")).await.unwrap());
    assert!(!resolver.verify_match_key(&MatchKey::new("M2")).await.unwrap());
}

// =============================================================================
// Full relay stream
// =============================================================================

#[tokio::test]
async fn test_state_then_scored_markers_from_replayed_frames() {
    let server = spawn_scorer().await;
    let mapping = create_match(&server, "M1", &["1", "2"]).await;

    let frames = tempfile::tempdir().unwrap();
    write_frame(
        frames.path(),
        "frame_0001",
        r#"[{"id": 1, "cx": 48.0, "cy": 24.0}, {"id": 3, "cx": 32.0, "cy": 24.0}]"#,
    );

    let consumer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let consumer_addr = consumer.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let (log, log_rx) = events::channel(256);
    let (_state_tx, state_rx) = watch::channel(platform_at(1.0, 2.0, 1_000));
    let (batch_tx, batch_rx) = watch::channel(None);

    let sampler = VisionSampler::new(
        Box::new(ReplayCamera::new(frames.path())),
        Box::new(RecordedDetector),
        Duration::from_millis(50),
        log.clone(),
    );
    let vision = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            sampler.run(batch_tx, Duration::from_millis(1_000), cancel)
        })
    };
    // Let the first batch land before the first cycle
    let mut batches = batch_rx.clone();
    tokio::time::timeout(READ_TIMEOUT, batches.changed())
        .await
        .unwrap()
        .unwrap();

    let relay = start_fusion(
        &consumer_addr,
        &server,
        "M1",
        FusionInputs {
            state_rx,
            batch_rx,
            log_rx,
        },
        log,
        cancel.clone(),
    );
    let (socket, _) = consumer.accept().await.unwrap();
    let mut lines = BufReader::new(socket).lines();

    let drone = next_json(&mut lines).await;
    assert_eq!(drone["type"], "DRONE");
    assert_eq!(drone["timestamp"], 1_000);
    assert_eq!(drone["x"], 1.0);
    assert!(drone["pitch"].is_null());

    let tag1 = next_json(&mut lines).await;
    assert_eq!(tag1["type"], "TAG");
    assert_eq!(tag1["id"], 1);
    assert_eq!(tag1["x"], 1.5);
    assert_eq!(tag1["y"], 2.0);
    assert_eq!(tag1["z"], 0.0);
    assert_eq!(tag1["points"], mapping["1"]);

    let tag3 = next_json(&mut lines).await;
    assert_eq!(tag3["type"], "TAG");
    assert_eq!(tag3["id"], 3);
    assert_eq!(tag3["points"], 0);

    let logs = read_until(&mut lines, 20, |v| {
        v["type"] == "LOG" && v["text"] == "Unknown tag_id: 3"
    })
    .await;
    let texts: Vec<&str> = logs.iter().filter_map(|v| v["text"].as_str()).collect();
    assert!(texts.contains(&"Match key M1 verified"));
    let decoded = format!("Tag 1 decoded successfully: {} points", mapping["1"]);
    assert!(texts.contains(&decoded.as_str()));
    assert_eq!(logs.last().unwrap()["severity"], 2);

    relay.stop().await;
    vision.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_scorer_scores_zero_and_logs() {
    let server = dead_url();
    let consumer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let consumer_addr = consumer.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let (log, log_rx) = events::channel(256);
    let (_state_tx, state_rx) = watch::channel(platform_at(0.0, 0.0, 10));
    let (_batch_tx, batch_rx) = watch::channel(Some(DetectionBatch {
        sequence: 1,
        captured_at: 10,
        detections: vec![Detection {
            marker_id: 5,
            center: NormalizedPoint::new(0.5, 0.5),
        }],
    }));

    let relay = start_fusion(
        &consumer_addr,
        &server,
        "M1",
        FusionInputs {
            state_rx,
            batch_rx,
            log_rx,
        },
        log,
        cancel,
    );
    let (socket, _) = consumer.accept().await.unwrap();
    let mut lines = BufReader::new(socket).lines();

    assert_eq!(next_json(&mut lines).await["type"], "DRONE");
    let tag = next_json(&mut lines).await;
    assert_eq!(tag["type"], "TAG");
    assert_eq!(tag["points"], 0);

    let logs = read_until(&mut lines, 20, |v| {
        v["text"]
            .as_str()
            .map(|t| t.starts_with("Decoder server not reachable"))
            .unwrap_or(false)
    })
    .await;
    assert!(logs.iter().any(|v| v["text"]
        .as_str()
        .map(|t| t.starts_with("Match key verification failed"))
        .unwrap_or(false)
        && v["severity"] == 1));

    relay.stop().await;
}

/// Camera that opens but never delivers a frame
struct BrokenCamera {
    open: bool,
}

impl Camera for BrokenCamera {
    fn describe(&self) -> String {
        "broken camera".to_string()
    }

    fn open(&mut self) -> Result<(), VisionError> {
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn capture(&mut self) -> Result<GrayFrame, VisionError> {
        Err(VisionError::Capture("sensor timeout".to_string()))
    }

    fn release(&mut self) {
        self.open = false;
    }
}

struct NoDetector;

impl MarkerDetector for NoDetector {
    fn detect(&mut self, _frame: &GrayFrame) -> Vec<Detection> {
        Vec::new()
    }
}

#[tokio::test]
async fn test_camera_failures_do_not_stop_state_or_logs() {
    let server = spawn_scorer().await;
    create_match(&server, "M1", &["1"]).await;
    let consumer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let consumer_addr = consumer.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let (log, log_rx) = events::channel(256);

    let (state_tx, state_rx) = watch::channel(PlatformState::unknown(8));
    let telemetry = tokio::spawn(
        TelemetryMode::Synthetic(SyntheticGenerator::with_seed(9, 1, 8)).run(
            state_tx,
            log.clone(),
            cancel.clone(),
        ),
    );

    let (batch_tx, batch_rx) = watch::channel(None);
    let sampler = VisionSampler::new(
        Box::new(BrokenCamera { open: false }),
        Box::new(NoDetector),
        Duration::from_millis(20),
        log.clone(),
    );
    let vision = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || sampler.run(batch_tx, Duration::from_millis(30), cancel))
    };

    let relay = start_fusion(
        &consumer_addr,
        &server,
        "M1",
        FusionInputs {
            state_rx,
            batch_rx,
            log_rx,
        },
        log,
        cancel.clone(),
    );
    let (socket, _) = consumer.accept().await.unwrap();
    let mut lines = BufReader::new(socket).lines();

    let mut drones = 0;
    let mut camera_logs = 0;
    for _ in 0..400 {
        let value = next_json(&mut lines).await;
        match value["type"].as_str() {
            Some("DRONE") => {
                drones += 1;
                let mode = value["flight_mode"].as_str();
                assert!(mode.is_none() || mode == Some("SIMULATION"));
            }
            Some("LOG") => {
                if value["text"]
                    .as_str()
                    .map(|t| t.starts_with("Camera read failed"))
                    .unwrap_or(false)
                {
                    camera_logs += 1;
                }
            }
            Some("TAG") => panic!("no frames, so no markers: {:?}", value),
            other => panic!("unexpected message type {:?}", other),
        }
        if drones >= 5 && camera_logs >= 2 {
            break;
        }
    }
    assert!(drones >= 5, "only {} DRONE messages", drones);
    assert!(camera_logs >= 2, "only {} camera failure logs", camera_logs);

    relay.stop().await;
    telemetry.await.unwrap();
    vision.await.unwrap();
}

#[tokio::test]
async fn test_consumer_loss_forces_reconnect_before_next_state() {
    let server = spawn_scorer().await;
    let consumer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let consumer_addr = consumer.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let (log, log_rx) = events::channel(256);
    let (state_tx, state_rx) = watch::channel(PlatformState::unknown(8));
    let telemetry = tokio::spawn(
        TelemetryMode::Synthetic(SyntheticGenerator::with_seed(4, 1, 8)).run(
            state_tx,
            log.clone(),
            cancel.clone(),
        ),
    );
    let (_batch_tx, batch_rx) = watch::channel(None);

    let relay = start_fusion(
        &consumer_addr,
        &server,
        "M1",
        FusionInputs {
            state_rx,
            batch_rx,
            log_rx,
        },
        log,
        cancel.clone(),
    );

    // First consumer session: read a state, then hang up
    {
        let (socket, _) = consumer.accept().await.unwrap();
        let mut lines = BufReader::new(socket).lines();
        read_until(&mut lines, 20, |v| v["type"] == "DRONE").await;
    }

    // The relay must come back on a fresh connection and resume the stream
    let (socket, _) = tokio::time::timeout(READ_TIMEOUT, consumer.accept())
        .await
        .expect("relay did not reconnect")
        .unwrap();
    let mut lines = BufReader::new(socket).lines();
    let seen = read_until(&mut lines, 20, |v| v["type"] == "DRONE").await;
    assert!(seen
        .iter()
        .all(|v| v["type"] == "DRONE" || v["type"] == "LOG"));

    relay.stop().await;
    telemetry.await.unwrap();
}

#[tokio::test]
async fn test_log_events_are_forwarded_with_integer_severity() {
    let server = spawn_scorer().await;
    let consumer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let consumer_addr = consumer.local_addr().unwrap().to_string();

    let cancel = CancellationToken::new();
    let (log, log_rx): (EventLog, mpsc::Receiver<_>) = events::channel(16);
    let (_state_tx, state_rx) = watch::channel(PlatformState::unknown(8));
    let (_batch_tx, batch_rx) = watch::channel(None);

    log.warn("No heartbeat detected. Will send dummy drone data.");
    let relay = start_fusion(
        &consumer_addr,
        &server,
        "NOPE",
        FusionInputs {
            state_rx,
            batch_rx,
            log_rx,
        },
        log,
        cancel,
    );
    let (socket, _) = consumer.accept().await.unwrap();
    let mut lines = BufReader::new(socket).lines();

    // All-unknown state goes out with nulls, never zeros
    let drone = next_json(&mut lines).await;
    assert_eq!(drone["type"], "DRONE");
    assert!(drone["x"].is_null());
    assert!(drone["battery_voltage"].is_null());
    assert!(drone["timestamp"].is_i64());

    let logs = read_until(&mut lines, 10, |v| v["text"] == "Invalid match_key: NOPE").await;
    let startup = logs
        .iter()
        .find(|v| v["text"] == "No heartbeat detected. Will send dummy drone data.")
        .expect("startup event kept for the first connection");
    assert_eq!(startup["severity"], 2);
    assert_eq!(logs.last().unwrap()["severity"], 1);

    relay.stop().await;
}
