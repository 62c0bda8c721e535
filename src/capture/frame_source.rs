use super::{CaptureSource, MediaStream, TrackSettings};
use crate::error::{CaptureError, EffectError};
use image::RgbaImage;
use std::time::{Duration, Instant};

/// How long `attach` waits for the first decoded frame
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const FIRST_FRAME_POLL: Duration = Duration::from_millis(5);

/// Render rates outside this range are clamped into it
const MIN_FRAME_RATE: f64 = 1.0;
const MAX_FRAME_RATE: f64 = 240.0;

/// Shape of a video stream for the lifetime of one session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

impl Geometry {
    /// Period of the render timer
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Resolve geometry from capabilities, falling back field by field to constraints
    pub fn resolve(
        capabilities: Option<TrackSettings>,
        constraints: Option<TrackSettings>,
        fallback_frame_rate: f64,
    ) -> Result<Self, EffectError> {
        let caps = capabilities.unwrap_or_default();
        let cons = constraints.unwrap_or_default();
        let positive = |v: &u32| *v > 0;
        let usable_rate = |r: &f64| r.is_finite() && *r > 0.0;

        let width = caps.width.filter(positive).or(cons.width.filter(positive));
        let height = caps.height.filter(positive).or(cons.height.filter(positive));
        let (width, height) = match (width, height) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                return Err(EffectError::EffectStart(
                    "video track reports no usable width/height".into(),
                ))
            }
        };

        let frame_rate = caps
            .frame_rate
            .filter(usable_rate)
            .or(cons.frame_rate.filter(usable_rate))
            .unwrap_or(fallback_frame_rate)
            .clamp(MIN_FRAME_RATE, MAX_FRAME_RATE);

        Ok(Self {
            width,
            height,
            frame_rate,
        })
    }
}

/// The live camera track presented as a readable frame sequence
pub struct FrameSource {
    track: Box<dyn CaptureSource>,
    geometry: Geometry,
    frame: RgbaImage,
    detached: bool,
    read_failures: u64,
}

impl FrameSource {
    /// Bind the first video track of `stream`
    ///
    /// Geometry is read once here and frozen for the session. Returns once the
    /// track has produced its first frame.
    pub fn attach(stream: MediaStream, fallback_frame_rate: f64) -> Result<Self, EffectError> {
        let mut track = stream.into_first_video().ok_or(EffectError::InvalidStream)?;

        let geometry =
            Geometry::resolve(track.capabilities(), track.constraints(), fallback_frame_rate)?;

        let frame = wait_for_first_frame(track.as_mut())?;

        tracing::info!(
            "Attached video track at {}x{} @ {:.1} fps",
            geometry.width,
            geometry.height,
            geometry.frame_rate
        );

        Ok(Self {
            track,
            geometry,
            frame,
            detached: false,
            read_failures: 0,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Pull the newest frame from the track
    ///
    /// Returns whether a new frame arrived. Read failures keep the previous frame.
    pub fn refresh(&mut self) -> Result<bool, EffectError> {
        if self.detached {
            return Err(EffectError::StreamDetached);
        }

        match self.track.poll_frame() {
            Ok(Some(frame)) => {
                self.frame = frame;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(CaptureError::Detached) => {
                tracing::warn!("Video track detached");
                self.detached = true;
                Err(EffectError::StreamDetached)
            }
            Err(CaptureError::Read(reason)) => {
                self.read_failures += 1;
                tracing::warn!(
                    failures = self.read_failures,
                    "Frame read failed, reusing previous frame: {}",
                    reason
                );
                Ok(false)
            }
        }
    }

    /// Latest decoded frame
    pub fn current_frame(&self) -> Result<&RgbaImage, EffectError> {
        if self.detached {
            return Err(EffectError::StreamDetached);
        }
        Ok(&self.frame)
    }

    /// Mark the input as removed by the host
    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }
}

fn wait_for_first_frame(track: &mut dyn CaptureSource) -> Result<RgbaImage, EffectError> {
    let deadline = Instant::now() + FIRST_FRAME_TIMEOUT;
    loop {
        match track.poll_frame() {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => {}
            Err(CaptureError::Detached) => {
                return Err(EffectError::EffectStart(
                    "video track detached before producing a frame".into(),
                ))
            }
            Err(CaptureError::Read(reason)) => {
                tracing::debug!("Waiting for first frame: {}", reason);
            }
        }

        if Instant::now() >= deadline {
            return Err(EffectError::EffectStart(
                "video track produced no frame".into(),
            ));
        }
        std::thread::sleep(FIRST_FRAME_POLL);
    }
}
