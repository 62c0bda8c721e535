mod loopback;
mod stream;

pub use loopback::V4L2Output;
pub use stream::{output_channel, OutputFeed, OutputStream};

use anyhow::Result;
use image::RgbaImage;

/// Trait for output destinations
pub trait OutputSink {
    /// Write a frame to the output
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}
