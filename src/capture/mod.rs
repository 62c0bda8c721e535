mod frame_source;
mod v4l_capture;

pub use frame_source::{FrameSource, Geometry};
pub use v4l_capture::WebcamCapture;

use crate::error::CaptureError;
use image::RgbaImage;

/// What a video track is showing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Camera,
    Desktop,
}

/// Width, height and frame rate as reported by a track
///
/// Any field may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
}

impl TrackSettings {
    pub fn new(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
        }
    }
}

/// Trait for camera capture sources
pub trait CaptureSource {
    /// Fetch the newest decoded frame
    ///
    /// `Ok(None)` means no new frame since the last call.
    fn poll_frame(&mut self) -> Result<Option<RgbaImage>, CaptureError>;

    /// Settings the device is actually delivering, if it can tell
    fn capabilities(&self) -> Option<TrackSettings>;

    /// Settings that were requested when the track was opened
    fn constraints(&self) -> Option<TrackSettings> {
        None
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Camera
    }
}

/// One track of a media stream
pub enum MediaTrack {
    Audio { label: String },
    Video(Box<dyn CaptureSource>),
}

impl MediaTrack {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaTrack::Video(_))
    }
}

/// A bundle of tracks handed over by the host
#[derive(Default)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video<S: CaptureSource + 'static>(mut self, source: S) -> Self {
        self.tracks.push(MediaTrack::Video(Box::new(source)));
        self
    }

    pub fn with_audio(mut self, label: impl Into<String>) -> Self {
        self.tracks.push(MediaTrack::Audio {
            label: label.into(),
        });
        self
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn first_video(&self) -> Option<&dyn CaptureSource> {
        self.tracks.iter().find_map(|track| match track {
            MediaTrack::Video(source) => Some(source.as_ref()),
            MediaTrack::Audio { .. } => None,
        })
    }

    /// Take ownership of the first video track, dropping the rest
    pub fn into_first_video(self) -> Option<Box<dyn CaptureSource>> {
        self.tracks.into_iter().find_map(|track| match track {
            MediaTrack::Video(source) => Some(source),
            MediaTrack::Audio { .. } => None,
        })
    }
}
