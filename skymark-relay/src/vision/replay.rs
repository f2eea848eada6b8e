//! Recorded-frame camera and detector
//!
//! `ReplayCamera` plays a directory of binary PGM (`P5`) frames in file name
//! order, looping. `RecordedDetector` reads the detections recorded for each
//! frame from a JSON sidecar (`frame_0001.pgm` -> `frame_0001.json`):
//!
//! ```json
//! [{"id": 3, "cx": 320.0, "cy": 240.0}]
//! ```
//!
//! Centers are in pixels and normalized by the frame size.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{Camera, Detection, GrayFrame, MarkerDetector, NormalizedPoint};
use crate::error::VisionError;

const FRAME_EXTENSION: &str = "pgm";
const SIDECAR_EXTENSION: &str = "json";

/// Camera over a directory of recorded frames
pub struct ReplayCamera {
    dir: PathBuf,
    frames: Vec<PathBuf>,
    cursor: usize,
    open: bool,
}

impl ReplayCamera {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            frames: Vec::new(),
            cursor: 0,
            open: false,
        }
    }
}

impl Camera for ReplayCamera {
    fn describe(&self) -> String {
        format!("replay camera {}", self.dir.display())
    }

    fn open(&mut self) -> Result<(), VisionError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| VisionError::DeviceUnavailable(format!("{}: {}", self.dir.display(), e)))?;

        let mut frames: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .map(|ext| ext.eq_ignore_ascii_case(FRAME_EXTENSION))
                        .unwrap_or(false)
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(VisionError::DeviceUnavailable(format!(
                "no .{} frames in {}",
                FRAME_EXTENSION,
                self.dir.display()
            )));
        }

        debug!("Replaying {} frames from {}", frames.len(), self.dir.display());
        self.frames = frames;
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn capture(&mut self) -> Result<GrayFrame, VisionError> {
        if !self.open || self.frames.is_empty() {
            return Err(VisionError::NotOpen);
        }
        let path = self.frames[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.frames.len();

        let bytes = fs::read(&path)
            .map_err(|e| VisionError::Capture(format!("{}: {}", path.display(), e)))?;
        let mut frame = parse_pgm(&bytes)?;
        frame.source = Some(path);
        Ok(frame)
    }

    fn release(&mut self) {
        self.open = false;
        self.frames.clear();
        self.cursor = 0;
    }
}

/// Parse a binary 8-bit PGM image
pub fn parse_pgm(bytes: &[u8]) -> Result<GrayFrame, VisionError> {
    let mut pos = 0;
    let magic = next_token(bytes, &mut pos)?;
    if magic != b"P5" {
        return Err(VisionError::Format("not a binary PGM (P5) image".to_string()));
    }
    let width = parse_number(next_token(bytes, &mut pos)?)?;
    let height = parse_number(next_token(bytes, &mut pos)?)?;
    let maxval = parse_number(next_token(bytes, &mut pos)?)?;
    if width == 0 || height == 0 {
        return Err(VisionError::Format("empty image".to_string()));
    }
    if maxval == 0 || maxval > 255 {
        return Err(VisionError::Format(format!(
            "unsupported maxval {} (8-bit only)",
            maxval
        )));
    }

    // Exactly one whitespace byte separates the header from the raster
    pos += 1;
    let len = (width as usize) * (height as usize);
    let pixels = bytes
        .get(pos..pos + len)
        .ok_or_else(|| VisionError::Format("truncated raster".to_string()))?
        .to_vec();

    Ok(GrayFrame {
        width,
        height,
        pixels,
        source: None,
    })
}

fn next_token<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8], VisionError> {
    loop {
        while *pos < bytes.len() && bytes[*pos].is_ascii_whitespace() {
            *pos += 1;
        }
        if *pos < bytes.len() && bytes[*pos] == b'#' {
            while *pos < bytes.len() && bytes[*pos] != b'\n' {
                *pos += 1;
            }
            continue;
        }
        break;
    }
    let start = *pos;
    while *pos < bytes.len() && !bytes[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    if start == *pos {
        return Err(VisionError::Format("truncated header".to_string()));
    }
    Ok(&bytes[start..*pos])
}

fn parse_number(token: &[u8]) -> Result<u32, VisionError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| VisionError::Format("bad header number".to_string()))
}

#[derive(Debug, Deserialize)]
struct RecordedMarker {
    id: u32,
    cx: f64,
    cy: f64,
}

/// Detector that replays detections recorded next to each frame
#[derive(Debug, Default)]
pub struct RecordedDetector;

impl RecordedDetector {
    fn sidecar(frame_path: &Path) -> PathBuf {
        frame_path.with_extension(SIDECAR_EXTENSION)
    }
}

impl MarkerDetector for RecordedDetector {
    fn detect(&mut self, frame: &GrayFrame) -> Vec<Detection> {
        let Some(path) = frame.source.as_deref().map(Self::sidecar) else {
            return Vec::new();
        };
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<Vec<RecordedMarker>>(&content) {
            Ok(markers) => markers
                .into_iter()
                .map(|m| Detection {
                    marker_id: m.id,
                    center: NormalizedPoint::from_pixels(m.cx, m.cy, frame.width, frame.height),
                })
                .collect(),
            Err(e) => {
                warn!("Ignoring malformed detections in {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }
}

/// Camera used when no source is configured; never opens
#[derive(Debug, Default)]
pub struct UnavailableCamera;

impl Camera for UnavailableCamera {
    fn describe(&self) -> String {
        "no camera".to_string()
    }

    fn open(&mut self) -> Result<(), VisionError> {
        Err(VisionError::DeviceUnavailable(
            "no camera source configured".to_string(),
        ))
    }

    fn is_open(&self) -> bool {
        false
    }

    fn capture(&mut self) -> Result<GrayFrame, VisionError> {
        Err(VisionError::NotOpen)
    }

    fn release(&mut self) {}
}
