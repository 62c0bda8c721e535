//! Per-tick compositing of camera frame, segmentation mask and background.
//!
//! The compositor owns the output canvas. Each render tick draws the current
//! frame into it at session geometry and then, if both a mask and a background
//! are available, replaces every background pixel with the background layer.
//! Alpha is binary per mask cell.

mod background;

pub use background::{
    BackgroundLoader, BackgroundSource, FsBackgroundLoader, LoadedBackground, DEFAULT_BLUR_SIGMA,
};

use crate::capture::Geometry;
use crate::error::EffectError;
use crate::segmentation::types::BACKGROUND;
use crate::segmentation::SegmentationMask;
use image::{imageops, RgbaImage};

/// Largest canvas we agree to allocate (8K RGBA)
const MAX_CANVAS_BYTES: usize = 7680 * 4320 * 4;

/// Blur runs at a fraction of the canvas size
const BLUR_DOWNSCALE: u32 = 4;

/// What a render tick produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Unmodified camera frame
    Passthrough,
    /// Background replaced using the latest mask
    Composited,
}

enum PreparedBackground {
    /// Image already scaled to the canvas, fully opaque
    Image(RgbaImage),
    Blur { sigma: f32 },
}

pub struct Compositor {
    geometry: Geometry,
    canvas: RgbaImage,
    background: Option<PreparedBackground>,
}

impl Compositor {
    /// Allocate the output canvas at `geometry`
    pub fn new(geometry: Geometry) -> Result<Self, EffectError> {
        let bytes = (geometry.width as usize)
            .checked_mul(geometry.height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .filter(|bytes| *bytes > 0 && *bytes <= MAX_CANVAS_BYTES)
            .ok_or_else(|| {
                EffectError::EffectStart(format!(
                    "cannot allocate a {}x{} output canvas",
                    geometry.width, geometry.height
                ))
            })?;

        tracing::debug!("Allocated {} byte output canvas", bytes);

        Ok(Self {
            geometry,
            canvas: RgbaImage::new(geometry.width, geometry.height),
            background: None,
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Use `background` from the next render on
    pub fn set_background(&mut self, background: &LoadedBackground) {
        let prepared = match background {
            LoadedBackground::Image { image, .. } => {
                let (width, height) = self.geometry.dimensions();
                let mut layer = if image.dimensions() == (width, height) {
                    image.clone()
                } else {
                    imageops::resize(image, width, height, imageops::FilterType::Triangle)
                };
                for pixel in layer.pixels_mut() {
                    pixel[3] = 255;
                }
                PreparedBackground::Image(layer)
            }
            LoadedBackground::Blur { sigma } => PreparedBackground::Blur { sigma: *sigma },
        };
        self.background = Some(prepared);
    }

    pub fn clear_background(&mut self) {
        self.background = None;
    }

    pub fn has_background(&self) -> bool {
        self.background.is_some()
    }

    /// Produce one output frame
    ///
    /// Without a mask or a background the frame passes through unchanged.
    /// `frame` is never modified.
    pub fn render(&mut self, frame: &RgbaImage, mask: Option<&SegmentationMask>) -> RenderMode {
        self.draw_frame(frame);

        let (mask, background) = match (mask, &self.background) {
            (Some(mask), Some(background)) => (mask, background),
            _ => return RenderMode::Passthrough,
        };

        match background {
            PreparedBackground::Image(layer) => replace_background(&mut self.canvas, mask, layer),
            PreparedBackground::Blur { sigma } => {
                let blurred = blurred_copy(&self.canvas, *sigma);
                replace_background(&mut self.canvas, mask, &blurred);
            }
        }

        RenderMode::Composited
    }

    /// The output canvas as of the last render
    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    fn draw_frame(&mut self, frame: &RgbaImage) {
        let (width, height) = self.geometry.dimensions();
        if frame.dimensions() == (width, height) {
            self.canvas.copy_from_slice(frame.as_raw());
        } else {
            tracing::trace!(
                "Scaling {}x{} frame to {}x{}",
                frame.width(),
                frame.height(),
                width,
                height
            );
            self.canvas = imageops::resize(frame, width, height, imageops::FilterType::Triangle);
        }
    }
}

/// Copy `layer` into every canvas pixel whose mask cell is background
///
/// The mask is sampled nearest-cell when its resolution differs from the canvas.
fn replace_background(canvas: &mut RgbaImage, mask: &SegmentationMask, layer: &RgbaImage) {
    let (width, height) = canvas.dimensions();
    let (mask_w, mask_h) = mask.dimensions();
    let row_bytes = width as usize * 4;

    let columns: Vec<usize> = (0..width as u64)
        .map(|x| (x * mask_w as u64 / width as u64) as usize)
        .collect();

    let layer = layer.as_raw();
    let cells = mask.data();

    for (y, row) in canvas.chunks_exact_mut(row_bytes).enumerate() {
        let mask_y = (y as u64 * mask_h as u64 / height as u64) as usize;
        let mask_row = &cells[mask_y * mask_w as usize..(mask_y + 1) * mask_w as usize];
        let layer_row = &layer[y * row_bytes..(y + 1) * row_bytes];

        for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
            if mask_row[columns[x]] == BACKGROUND {
                pixel.copy_from_slice(&layer_row[x * 4..x * 4 + 4]);
            }
        }
    }
}

fn blurred_copy(frame: &RgbaImage, sigma: f32) -> RgbaImage {
    let (width, height) = frame.dimensions();
    let small_w = (width / BLUR_DOWNSCALE).max(1);
    let small_h = (height / BLUR_DOWNSCALE).max(1);

    let small = imageops::resize(frame, small_w, small_h, imageops::FilterType::Triangle);
    let small = imageops::blur(&small, (sigma / BLUR_DOWNSCALE as f32).max(0.5));
    imageops::resize(&small, width, height, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn geometry(width: u32, height: u32) -> Geometry {
        Geometry {
            width,
            height,
            frame_rate: 30.0,
        }
    }

    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| Rgba([(x * 10) as u8, (y * 10) as u8, 77, 255]))
    }

    fn image_background(color: [u8; 4], width: u32, height: u32) -> LoadedBackground {
        LoadedBackground::Image {
            source: "bg".into(),
            image: RgbaImage::from_pixel(width, height, Rgba(color)),
        }
    }

    #[test]
    fn test_passthrough_without_mask() {
        let frame = gradient(8, 6);
        let mut compositor = Compositor::new(geometry(8, 6)).unwrap();
        compositor.set_background(&image_background([0, 255, 0, 255], 8, 6));

        assert_eq!(compositor.render(&frame, None), RenderMode::Passthrough);
        assert_eq!(compositor.canvas(), &frame);
    }

    #[test]
    fn test_passthrough_without_background() {
        let frame = gradient(8, 6);
        let mask = SegmentationMask::from_fn(4, 3, |_, _| false);
        let mut compositor = Compositor::new(geometry(8, 6)).unwrap();

        assert_eq!(compositor.render(&frame, Some(&mask)), RenderMode::Passthrough);
        assert_eq!(compositor.canvas(), &frame);
    }

    #[test]
    fn test_scaled_mask_lookup() {
        let frame = gradient(8, 6);
        // Half resolution mask, left half background
        let mask = SegmentationMask::from_fn(4, 3, |x, _| x >= 2);
        let mut compositor = Compositor::new(geometry(8, 6)).unwrap();
        compositor.set_background(&image_background([0, 255, 0, 255], 8, 6));

        assert_eq!(compositor.render(&frame, Some(&mask)), RenderMode::Composited);
        for (x, y, pixel) in compositor.canvas().enumerate_pixels() {
            if x < 4 {
                assert_eq!(pixel, &Rgba([0, 255, 0, 255]), "({x},{y}) should be background");
            } else {
                assert_eq!(pixel, frame.get_pixel(x, y), "({x},{y}) should be camera");
            }
        }
    }

    #[test]
    fn test_background_image_scaled_and_opaque() {
        let frame = gradient(8, 6);
        let mask = SegmentationMask::from_fn(1, 1, |_, _| false);
        let mut compositor = Compositor::new(geometry(8, 6)).unwrap();
        compositor.set_background(&image_background([9, 9, 9, 0], 2, 2));

        compositor.render(&frame, Some(&mask));
        assert!(compositor
            .canvas()
            .pixels()
            .all(|p| *p == Rgba([9, 9, 9, 255])));
    }

    #[test]
    fn test_frame_resized_to_session_geometry() {
        let frame = gradient(16, 12);
        let mut compositor = Compositor::new(geometry(8, 6)).unwrap();
        compositor.render(&frame, None);
        assert_eq!(compositor.canvas().dimensions(), (8, 6));
    }

    #[test]
    fn test_blur_keeps_person_pixels() {
        let frame = RgbaImage::from_fn(16, 16, |x, _| {
            if x < 8 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let mask = SegmentationMask::from_fn(16, 16, |_, y| y >= 8);
        let mut compositor = Compositor::new(geometry(16, 16)).unwrap();
        compositor.set_background(&LoadedBackground::Blur { sigma: 8.0 });

        assert_eq!(compositor.render(&frame, Some(&mask)), RenderMode::Composited);
        let canvas = compositor.canvas();
        for y in 8..16 {
            for x in 0..16 {
                assert_eq!(canvas.get_pixel(x, y), frame.get_pixel(x, y));
            }
        }
        // The hard edge is softened in the background rows
        let edge = canvas.get_pixel(7, 0)[0];
        assert!(edge > 0 && edge < 255, "edge value {edge}");
    }

    #[test]
    fn test_input_frame_untouched() {
        let frame = gradient(8, 6);
        let copy = frame.clone();
        let mask = SegmentationMask::from_fn(8, 6, |_, _| false);
        let mut compositor = Compositor::new(geometry(8, 6)).unwrap();
        compositor.set_background(&image_background([1, 2, 3, 255], 8, 6));
        compositor.render(&frame, Some(&mask));
        assert_eq!(frame, copy);
    }

    #[test]
    fn test_oversized_canvas_rejected() {
        assert!(matches!(
            Compositor::new(geometry(100_000, 100_000)),
            Err(EffectError::EffectStart(_))
        ));
        assert!(Compositor::new(geometry(0, 10)).is_err());
    }
}
