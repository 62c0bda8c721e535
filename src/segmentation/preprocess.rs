use super::types::{SegmentationMask, BACKGROUND, FOREGROUND};
use anyhow::{ensure, Result};
use image::{imageops, RgbaImage};
use ndarray::Array4;

/// Models with an output stride need input dimensions that are a multiple of it
const OUTPUT_STRIDE: u32 = 16;

/// Preprocessor for converting camera frames to model input tensors
pub struct Preprocessor {
    threshold: f32,
}

impl Preprocessor {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Round a working size up to the model's output stride
    pub fn aligned_size(width: u32, height: u32) -> (u32, u32) {
        let align = |v: u32| v.max(1).div_ceil(OUTPUT_STRIDE) * OUTPUT_STRIDE;
        (align(width), align(height))
    }

    /// Preprocess an RGBA frame into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Resize to the working size
    /// 2. Drop alpha, convert to float and normalize to [0, 1]
    /// 3. Transpose from HWC to NCHW format
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn to_tensor(&self, frame: &RgbaImage, width: u32, height: u32) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let image = if frame.dimensions() != (width, height) {
            resized = imageops::resize(frame, width, height, imageops::FilterType::Triangle);
            &resized
        } else {
            frame
        };

        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }

        tensor
    }

    /// Threshold a row-major person probability map into a binary mask
    pub fn to_mask(&self, probabilities: &[f32], width: u32, height: u32) -> Result<SegmentationMask> {
        let _span = tracing::debug_span!("postprocess").entered();

        ensure!(
            probabilities.len() == width as usize * height as usize,
            "model produced {} scores for a {}x{} map",
            probabilities.len(),
            width,
            height
        );

        let data = probabilities
            .iter()
            .map(|&p| if p >= self.threshold { FOREGROUND } else { BACKGROUND })
            .collect();

        SegmentationMask::new(width, height, data)
    }
}
