//! Segmented-background compositing for live camera video.
//!
//! A camera stream is segmented into person and background at a throttled
//! cadence on a worker thread, and every render tick composites the freshest
//! mask against a background image or blur. The result is a replacement
//! video stream for the host's local camera track.

pub mod capture;
pub mod compositor;
pub mod config;
pub mod effect;
pub mod error;
pub mod output;
pub mod segmentation;

pub use capture::{CaptureSource, FrameSource, Geometry, MediaStream, TrackKind, TrackSettings};
pub use compositor::{BackgroundSource, Compositor, RenderMode};
pub use config::{EffectConfig, EffectSettings, Quality};
pub use effect::{BackgroundEffectController, EffectDriver, EffectEvent};
pub use error::{CaptureError, EffectError};
pub use output::OutputStream;
pub use segmentation::{MaskScheduler, SegmentationEngine, SegmentationMask};
