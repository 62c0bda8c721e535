#![allow(dead_code)]

use anyhow::{anyhow, Result};
use backdrop::capture::{CaptureSource, MediaStream, TrackKind, TrackSettings};
use backdrop::compositor::BackgroundLoader;
use backdrop::error::CaptureError;
use backdrop::segmentation::{share_engine, ResolutionHint, SegmentationEngine, SegmentationMask, SharedEngine};
use backdrop::BackgroundEffectController;
use crossbeam::channel::{self, Receiver, Sender};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub const BG1: Rgba<u8> = Rgba([200, 10, 10, 255]);
pub const BG2: Rgba<u8> = Rgba([10, 10, 200, 255]);

/// Deterministic camera frame with a distinct value per pixel
pub fn camera_frame(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 251) as u8, (y % 241) as u8, ((x + y) % 7) as u8 + 40, 255])
    })
}

struct CameraState {
    frame: RgbaImage,
    caps: Option<TrackSettings>,
    detached: bool,
    polls: usize,
}

/// In-memory camera track
pub struct SyntheticCamera {
    state: Arc<Mutex<CameraState>>,
    constraints: Option<TrackSettings>,
    kind: TrackKind,
}

/// Test-side control of a `SyntheticCamera`
#[derive(Clone)]
pub struct CameraHandle {
    state: Arc<Mutex<CameraState>>,
}

impl CameraHandle {
    pub fn set_frame(&self, frame: RgbaImage) {
        self.state.lock().frame = frame;
    }

    /// Report different capabilities from now on
    pub fn set_capabilities(&self, caps: Option<TrackSettings>) {
        self.state.lock().caps = caps;
    }

    pub fn detach(&self) {
        self.state.lock().detached = true;
    }

    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, frame_rate: f64) -> (Self, CameraHandle) {
        let state = Arc::new(Mutex::new(CameraState {
            frame: camera_frame(width, height),
            caps: Some(TrackSettings::new(width, height, frame_rate)),
            detached: false,
            polls: 0,
        }));
        let camera = Self {
            state: state.clone(),
            constraints: None,
            kind: TrackKind::Camera,
        };
        (camera, CameraHandle { state })
    }

    pub fn with_capabilities(self, caps: Option<TrackSettings>) -> Self {
        self.state.lock().caps = caps;
        self
    }

    pub fn with_constraints(mut self, constraints: Option<TrackSettings>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_kind(mut self, kind: TrackKind) -> Self {
        self.kind = kind;
        self
    }
}

impl CaptureSource for SyntheticCamera {
    fn poll_frame(&mut self) -> Result<Option<RgbaImage>, CaptureError> {
        let mut state = self.state.lock();
        state.polls += 1;
        if state.detached {
            return Err(CaptureError::Detached);
        }
        Ok(Some(state.frame.clone()))
    }

    fn capabilities(&self) -> Option<TrackSettings> {
        self.state.lock().caps
    }

    fn constraints(&self) -> Option<TrackSettings> {
        self.constraints
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }
}

pub fn camera_stream(width: u32, height: u32, frame_rate: f64) -> (MediaStream, CameraHandle) {
    let (camera, handle) = SyntheticCamera::new(width, height, frame_rate);
    (MediaStream::new().with_video(camera), handle)
}

type Reply = Result<SegmentationMask, String>;

/// Segmentation engine that answers only when the test releases it
struct GatedEngine {
    replies: Receiver<Reply>,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    overlap: Arc<AtomicUsize>,
}

impl SegmentationEngine for GatedEngine {
    fn segment(&mut self, _frame: &RgbaImage, _hint: ResolutionHint) -> anyhow::Result<SegmentationMask> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.running.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlap.fetch_add(1, Ordering::SeqCst);
        }
        let reply = self.replies.recv();
        self.running.fetch_sub(1, Ordering::SeqCst);
        match reply {
            Ok(Ok(mask)) => Ok(mask),
            Ok(Err(reason)) => Err(anyhow!(reason)),
            Err(_) => Err(anyhow!("gate closed")),
        }
    }

    fn name(&self) -> &str {
        "gated"
    }
}

/// Releases calls into a gated engine
pub struct Gate {
    replies: Sender<Reply>,
    calls: Arc<AtomicUsize>,
    overlap: Arc<AtomicUsize>,
}

impl Gate {
    pub fn release(&self, mask: SegmentationMask) {
        let _ = self.replies.send(Ok(mask));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.replies.send(Err(reason.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Times a segment call started while another was still running
    pub fn overlapping_calls(&self) -> usize {
        self.overlap.load(Ordering::SeqCst)
    }
}

pub fn gated_engine() -> (SharedEngine, Gate) {
    let (tx, rx) = channel::unbounded();
    let calls = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let engine = GatedEngine {
        replies: rx,
        calls: calls.clone(),
        running: Arc::new(AtomicUsize::new(0)),
        overlap: overlap.clone(),
    };
    (
        share_engine(engine),
        Gate {
            replies: tx,
            calls,
            overlap,
        },
    )
}

/// Mask marking the left half of the frame as background
pub fn left_half_background(width: u32, height: u32) -> SegmentationMask {
    SegmentationMask::from_fn(width, height, |x, _| x >= width / 2)
}

/// Serves solid-colour backgrounds named "bg1" and "bg2"
pub struct MemoryLoader;

impl BackgroundLoader for MemoryLoader {
    fn load_image(&self, reference: &str) -> Result<RgbaImage> {
        match reference {
            "bg1" => Ok(RgbaImage::from_pixel(64, 48, BG1)),
            "bg2" => Ok(RgbaImage::from_pixel(64, 48, BG2)),
            other => Err(anyhow!("no such background: {other}")),
        }
    }
}

/// Render until the controller holds a mask other than `previous`
pub fn render_until_new_mask(
    controller: &mut BackgroundEffectController,
    previous: Option<Arc<SegmentationMask>>,
) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if controller.render_tick().is_err() {
            return false;
        }
        let current = controller.latest_mask();
        let changed = match (&current, &previous) {
            (Some(now), Some(before)) => !Arc::ptr_eq(now, before),
            (Some(_), None) => true,
            _ => false,
        };
        if changed {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Render until the session has seen `failures` consecutive segmentation failures
pub fn render_until_failures(controller: &mut BackgroundEffectController, failures: u32) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if controller.render_tick().is_err() {
            return false;
        }
        if controller.stats().is_none() {
            return false;
        }
        if controller.consecutive_failures() >= failures {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}
