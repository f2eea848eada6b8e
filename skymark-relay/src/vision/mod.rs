//! Vision sampler
//!
//! Owns the camera and turns frames into [`DetectionBatch`]es. Acquisition
//! blocks and retries until the device opens; a failed capture releases the
//! device and yields no detections for that sample. The sampler runs on a
//! dedicated blocking thread and publishes only its latest batch.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use skymark_common::{time, PlatformState};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::VisionError;
use crate::events::EventLog;

pub mod replay;

pub use replay::{RecordedDetector, ReplayCamera, UnavailableCamera};

/// Granularity of cancellable sleeps on the vision thread
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Grayscale image, row-major, one byte per pixel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    /// File the frame was read from, for recorded sources
    pub source: Option<PathBuf>,
}

/// Camera device capability
pub trait Camera: Send {
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<(), VisionError>;

    fn is_open(&self) -> bool;

    fn capture(&mut self) -> Result<GrayFrame, VisionError>;

    /// Release the device; safe to call when already released
    fn release(&mut self);
}

/// Marker detection capability
pub trait MarkerDetector: Send {
    /// Markers visible in `frame`, in no particular order
    fn detect(&mut self, frame: &GrayFrame) -> Vec<Detection>;
}

/// Image position with both coordinates in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedPoint {
    pub x: f64,
    pub y: f64,
}

impl NormalizedPoint {
    /// Clamps each coordinate into `[0, 1]`; NaN becomes the image center
    pub fn new(x: f64, y: f64) -> Self {
        fn unit(v: f64) -> f64 {
            if v.is_nan() {
                0.5
            } else {
                v.clamp(0.0, 1.0)
            }
        }
        Self {
            x: unit(x),
            y: unit(y),
        }
    }

    /// Normalize a pixel position by the frame size
    pub fn from_pixels(cx: f64, cy: f64, width: u32, height: u32) -> Self {
        let w = f64::from(width.max(1));
        let h = f64::from(height.max(1));
        Self::new(cx / w, cy / h)
    }

    /// Signed offset from the image center, each axis in `[-1, 1]`
    pub fn offset(&self) -> (f64, f64) {
        (2.0 * self.x - 1.0, 2.0 * self.y - 1.0)
    }
}

/// One marker seen in one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub marker_id: u32,
    pub center: NormalizedPoint,
}

/// Marker position in platform-local world coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Project a detection onto the ground plane below the platform
///
/// The normalized image offset is added straight to the platform's x/y and
/// z is ground level. Unknown platform coordinates count as 0.0.
pub fn world_position(state: &PlatformState, center: NormalizedPoint) -> WorldPoint {
    let (dx, dy) = center.offset();
    WorldPoint {
        x: state.x.unwrap_or(0.0) + dx,
        y: state.y.unwrap_or(0.0) + dy,
        z: 0.0,
    }
}

/// Detections from one captured frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    /// Increases with every captured frame
    pub sequence: u64,
    /// Capture time, epoch milliseconds
    pub captured_at: i64,
    pub detections: Vec<Detection>,
}

/// Camera plus detector with acquisition and release policy
pub struct VisionSampler {
    camera: Box<dyn Camera>,
    detector: Box<dyn MarkerDetector>,
    retry_delay: Duration,
    log: EventLog,
    sequence: u64,
}

impl VisionSampler {
    pub fn new(
        camera: Box<dyn Camera>,
        detector: Box<dyn MarkerDetector>,
        retry_delay: Duration,
        log: EventLog,
    ) -> Self {
        Self {
            camera,
            detector,
            retry_delay,
            log,
            sequence: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.camera.is_open()
    }

    /// Open the camera, retrying on the fixed delay until it reports open
    ///
    /// Blocks the calling thread. Returns false only when cancelled.
    pub fn acquire(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.camera.open() {
                Ok(()) if self.camera.is_open() => {
                    self.log.info("Camera opened successfully");
                    return true;
                }
                Ok(()) => debug!("{} reported success but is not open", self.camera.describe()),
                Err(e) => debug!("Opening {} failed: {}", self.camera.describe(), e),
            }
            self.camera.release();
            self.log.warn(format!(
                "Camera not available. Retrying in {} seconds...",
                self.retry_delay.as_secs_f64()
            ));
            if !sleep_unless_cancelled(self.retry_delay, cancel) {
                return false;
            }
        }
    }

    /// Capture one frame; on failure the camera is released
    pub fn sample_frame(&mut self) -> Option<GrayFrame> {
        if !self.camera.is_open() {
            return None;
        }
        match self.camera.capture() {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.log
                    .warn(format!("Camera read failed ({}). Reopening camera...", e));
                self.camera.release();
                None
            }
        }
    }

    pub fn detect(&mut self, frame: &GrayFrame) -> Vec<Detection> {
        self.detector.detect(frame)
    }

    /// One acquisition-capture-detect pass
    ///
    /// None when the camera could not deliver a frame this time.
    pub fn sample(&mut self, cancel: &CancellationToken) -> Option<DetectionBatch> {
        if !self.camera.is_open() && !self.acquire(cancel) {
            return None;
        }
        let frame = self.sample_frame()?;
        let detections = self.detect(&frame);
        self.sequence += 1;
        Some(DetectionBatch {
            sequence: self.sequence,
            captured_at: time::now_millis(),
            detections,
        })
    }

    /// Sample on `interval` and publish each batch until cancelled
    ///
    /// Blocking; run with `spawn_blocking`.
    pub fn run(
        mut self,
        tx: watch::Sender<Option<DetectionBatch>>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        while !cancel.is_cancelled() {
            let started = Instant::now();
            if let Some(batch) = self.sample(&cancel) {
                tx.send_replace(Some(batch));
            }
            let remaining = interval.saturating_sub(started.elapsed());
            if !sleep_unless_cancelled(remaining, &cancel) {
                break;
            }
        }
        info!("Vision sampler stopped");
    }
}

impl Drop for VisionSampler {
    fn drop(&mut self) {
        self.camera.release();
    }
}

/// Sleep in short slices; false when cancelled before the time is up
fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted camera and detector doubles

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Outcome of one capture call
    #[derive(Clone)]
    pub enum Shot {
        Frame(Vec<Detection>),
        Fail,
    }

    #[derive(Clone, Default)]
    pub struct CameraScript {
        pub open_failures: Arc<Mutex<u32>>,
        pub shots: Arc<Mutex<VecDeque<Shot>>>,
        pub releases: Arc<Mutex<u32>>,
    }

    pub struct ScriptedCamera {
        pub script: CameraScript,
        pub open: bool,
        /// Detections of the frame most recently captured
        pub pending: Arc<Mutex<Vec<Detection>>>,
    }

    impl Camera for ScriptedCamera {
        fn describe(&self) -> String {
            "scripted camera".to_string()
        }

        fn open(&mut self) -> Result<(), VisionError> {
            let mut failures = self.script.open_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(VisionError::DeviceUnavailable("unplugged".to_string()));
            }
            self.open = true;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn capture(&mut self) -> Result<GrayFrame, VisionError> {
            match self.script.shots.lock().unwrap().pop_front() {
                Some(Shot::Frame(detections)) => {
                    *self.pending.lock().unwrap() = detections;
                    Ok(GrayFrame {
                        width: 4,
                        height: 4,
                        pixels: vec![0; 16],
                        source: None,
                    })
                }
                Some(Shot::Fail) | None => Err(VisionError::Capture("no frame".to_string())),
            }
        }

        fn release(&mut self) {
            if self.open {
                *self.script.releases.lock().unwrap() += 1;
            }
            self.open = false;
        }
    }

    pub struct PendingDetector(pub Arc<Mutex<Vec<Detection>>>);

    impl MarkerDetector for PendingDetector {
        fn detect(&mut self, _frame: &GrayFrame) -> Vec<Detection> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    /// Sampler over a scripted camera
    pub fn scripted_sampler(script: &CameraScript, log: EventLog) -> VisionSampler {
        let pending = Arc::new(Mutex::new(Vec::new()));
        VisionSampler::new(
            Box::new(ScriptedCamera {
                script: script.clone(),
                open: false,
                pending: Arc::clone(&pending),
            }),
            Box::new(PendingDetector(pending)),
            Duration::from_millis(10),
            log,
        )
    }

    pub fn detection(marker_id: u32, x: f64, y: f64) -> Detection {
        Detection {
            marker_id,
            center: NormalizedPoint::new(x, y),
        }
    }
}
