//! Synthetic platform data for running without a telemetry source
//!
//! Values hover around a fixed hover point with small jitter and are
//! labelled with the [`SYNTHETIC_FLIGHT_MODE`] flight mode so the consumer
//! can tell them apart from live data.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skymark_common::platform::PLATFORM_KIND_DRONE;
use skymark_common::PlatformState;

/// Flight mode label of synthetic states
pub const SYNTHETIC_FLIGHT_MODE: &str = "SIMULATION";

const HOVER_POINT: (f64, f64, f64) = (3.0, 3.0, 5.0);
const POSITION_JITTER: f64 = 0.25;
const TILT_LIMIT: f64 = 0.1;
const SYNTHETIC_VOLTAGE: f64 = 12.0;
const SYNTHETIC_RSSI: u8 = 100;

/// Produces plausible bounded platform states
pub struct SyntheticGenerator {
    rng: StdRng,
    state: PlatformState,
}

impl SyntheticGenerator {
    pub fn new(platform_id: u32, log_capacity: usize) -> Self {
        Self::with_rng(StdRng::from_entropy(), platform_id, log_capacity)
    }

    /// Deterministic generator
    pub fn with_seed(seed: u64, platform_id: u32, log_capacity: usize) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), platform_id, log_capacity)
    }

    fn with_rng(rng: StdRng, platform_id: u32, log_capacity: usize) -> Self {
        let mut state = PlatformState::unknown(log_capacity);
        state.set_identity(PLATFORM_KIND_DRONE, platform_id);
        Self { rng, state }
    }

    /// Next synthetic state, stamped `now_ms`
    pub fn sample(&mut self, now_ms: i64) -> PlatformState {
        let rng = &mut self.rng;
        let state = &mut self.state;

        state.x = Some(HOVER_POINT.0 + rng.gen_range(-POSITION_JITTER..=POSITION_JITTER));
        state.y = Some(HOVER_POINT.1 + rng.gen_range(-POSITION_JITTER..=POSITION_JITTER));
        state.z = Some(HOVER_POINT.2 + rng.gen_range(-POSITION_JITTER..=POSITION_JITTER));
        state.pitch = Some(rng.gen_range(-TILT_LIMIT..=TILT_LIMIT));
        state.roll = Some(rng.gen_range(-TILT_LIMIT..=TILT_LIMIT));
        state.yaw = Some(rng.gen_range(-PI..=PI));
        state.armable = Some(false);
        state.armed = Some(false);
        state.battery_voltage = Some(SYNTHETIC_VOLTAGE);
        state.battery_percentage = Some(rng.gen_range(50..=100));
        state.flight_mode = Some(SYNTHETIC_FLIGHT_MODE.to_string());
        state.rssi = Some(SYNTHETIC_RSSI);
        state.touch(now_ms);

        state.clone()
    }
}
