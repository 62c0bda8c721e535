use anyhow::{ensure, Result};
use image::RgbaImage;
use parking_lot::Mutex;
use std::sync::Arc;

/// Mask cell value for a person pixel
pub const FOREGROUND: u8 = 1;
/// Mask cell value for a background pixel
pub const BACKGROUND: u8 = 0;

/// Internal resolution the model runs at, as a fraction of the source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionHint {
    scale: f32,
}

impl ResolutionHint {
    /// Scale is clamped into (0, 1]
    pub fn new(scale: f32) -> Self {
        let scale = if scale.is_finite() {
            scale.clamp(0.05, 1.0)
        } else {
            1.0
        };
        Self { scale }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Working size for a source of `width` x `height`, never below 1x1
    pub fn working_size(&self, width: u32, height: u32) -> (u32, u32) {
        let w = ((width as f32 * self.scale).round() as u32).max(1);
        let h = ((height as f32 * self.scale).round() as u32).max(1);
        (w, h)
    }
}

impl Default for ResolutionHint {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// Per-pixel person/background classification
///
/// Stored row-major at the model's working resolution, which need not match
/// the frame it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationMask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl SegmentationMask {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        ensure!(width > 0 && height > 0, "mask must not be empty");
        ensure!(
            data.len() == width as usize * height as usize,
            "mask data has {} cells, expected {}x{}",
            data.len(),
            width,
            height
        );
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a mask from a per-cell predicate (true = person)
    pub fn from_fn(width: u32, height: u32, mut is_person: impl FnMut(u32, u32) -> bool) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(if is_person(x, y) { FOREGROUND } else { BACKGROUND });
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        self.data[(y * self.width + x) as usize] != BACKGROUND
    }

    /// Fraction of cells classified as person
    pub fn coverage(&self) -> f32 {
        let people = self.data.iter().filter(|&&v| v != BACKGROUND).count();
        people as f32 / self.data.len() as f32
    }
}

/// Trait for segmentation models
/// Allows swapping between different backends (ONNX models, test doubles, ...)
pub trait SegmentationEngine: Send {
    /// Classify every pixel of `frame` as person or background
    ///
    /// The mask is sized from `hint`, not from the frame. Latency may exceed the
    /// render interval; callers never overlap two calls.
    fn segment(&mut self, frame: &RgbaImage, hint: ResolutionHint) -> Result<SegmentationMask>;

    /// Reset internal state (for models with temporal/recurrent components)
    ///
    /// Called at the start of every effect session.
    fn reset_state(&mut self) {
        // Default implementation: no-op for stateless models
    }

    fn name(&self) -> &str {
        "segmentation"
    }
}

/// Engine shared between the controller and the worker of the current session
pub type SharedEngine = Arc<Mutex<Box<dyn SegmentationEngine>>>;

pub fn share_engine<E: SegmentationEngine + 'static>(engine: E) -> SharedEngine {
    Arc::new(Mutex::new(Box::new(engine)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_length_checked() {
        assert!(SegmentationMask::new(4, 4, vec![0; 15]).is_err());
        assert!(SegmentationMask::new(0, 4, vec![]).is_err());
        assert!(SegmentationMask::new(4, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_from_fn_layout() {
        let mask = SegmentationMask::from_fn(4, 2, |x, _| x >= 2);
        assert_eq!(mask.data(), &[0, 0, 1, 1, 0, 0, 1, 1]);
        assert!(mask.is_foreground(3, 1));
        assert!(!mask.is_foreground(0, 1));
        assert_eq!(mask.coverage(), 0.5);
    }

    #[test]
    fn test_working_size() {
        let hint = ResolutionHint::new(0.5);
        assert_eq!(hint.working_size(640, 480), (320, 240));
        assert_eq!(ResolutionHint::new(0.01).working_size(10, 10), (1, 1));
        assert_eq!(ResolutionHint::new(4.0).scale(), 1.0);
    }
}
