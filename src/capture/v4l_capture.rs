use super::{CaptureSource, TrackKind, TrackSettings};
use crate::error::CaptureError;
use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage, RgbaImage};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;

pub struct WebcamCapture {
    camera: Camera,
    requested: TrackSettings,
}

impl WebcamCapture {
    pub fn new(device_index: u32, width: u32, height: u32, fps: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{} @ {} fps",
            device_index,
            width,
            height,
            fps
        );

        let index = CameraIndex::Index(device_index);
        let wanted = CameraFormat::new_from(width, height, FrameFormat::MJPEG, fps);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(wanted));

        let mut camera = Camera::new(index, requested).context("Failed to open camera")?;

        camera
            .open_stream()
            .context("Failed to open camera stream")?;

        let format = camera.camera_format();
        tracing::info!(
            "Webcam initialized at {}x{} @ {} fps",
            format.resolution().width(),
            format.resolution().height(),
            format.frame_rate()
        );

        Ok(Self {
            camera,
            requested: TrackSettings::new(width, height, fps as f64),
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn poll_frame(&mut self) -> Result<Option<RgbaImage>, CaptureError> {
        if !self.camera.is_stream_open() {
            return Err(CaptureError::Detached);
        }

        let frame = self.camera.frame().map_err(|e| {
            if self.camera.is_stream_open() {
                CaptureError::Read(e.to_string())
            } else {
                CaptureError::Detached
            }
        })?;

        let decoded = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::Read(format!("failed to decode frame: {e}")))?;

        let (width, height) = (decoded.width(), decoded.height());
        let rgb = RgbImage::from_raw(width, height, decoded.into_raw())
            .ok_or_else(|| CaptureError::Read("decoded frame has wrong length".into()))?;

        Ok(Some(DynamicImage::ImageRgb8(rgb).into_rgba8()))
    }

    fn capabilities(&self) -> Option<TrackSettings> {
        let format = self.camera.camera_format();
        Some(TrackSettings::new(
            format.resolution().width(),
            format.resolution().height(),
            format.frame_rate() as f64,
        ))
    }

    fn constraints(&self) -> Option<TrackSettings> {
        Some(self.requested)
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Camera
    }
}
