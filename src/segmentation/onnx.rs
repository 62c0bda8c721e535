use super::preprocess::Preprocessor;
use super::types::{ResolutionHint, SegmentationEngine, SegmentationMask};
use anyhow::{bail, Context, Result};
use image::RgbaImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

/// Person segmentation with a single-input ONNX model
///
/// The model takes an NCHW float frame in [0, 1] and returns a person
/// probability map shaped `[1, 1, H, W]` or `[1, H, W, 1]`. Input size follows
/// the resolution hint, so the model needs dynamic spatial axes.
pub struct OnnxPersonSegmenter {
    session: Session,
    preprocessor: Preprocessor,
    name: String,
}

impl OnnxPersonSegmenter {
    /// Load a segmentation model from an ONNX file
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `threshold` - Probability above which a pixel counts as person
    pub fn new<P: AsRef<Path>>(model_path: P, threshold: f32) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        tracing::info!("Segmentation model '{}' loaded (threshold {:.2})", name, threshold);

        Ok(Self {
            session,
            preprocessor: Preprocessor::new(threshold),
            name,
        })
    }
}

/// Spatial size of a probability map output
fn map_dimensions(dims: &[i64]) -> Result<(u32, u32)> {
    match dims {
        [1, 1, h, w] | [1, h, w, 1] | [1, h, w] if *h > 0 && *w > 0 => Ok((*w as u32, *h as u32)),
        other => bail!("unexpected segmentation output shape {:?}", other),
    }
}

impl SegmentationEngine for OnnxPersonSegmenter {
    fn segment(&mut self, frame: &RgbaImage, hint: ResolutionHint) -> Result<SegmentationMask> {
        let _span = tracing::debug_span!("onnx_segment").entered();

        let (work_w, work_h) = hint.working_size(frame.width(), frame.height());
        let (width, height) = Preprocessor::aligned_size(work_w, work_h);

        let input = self.preprocessor.to_tensor(frame, width, height);
        let input = Tensor::from_array((
            vec![1i64, 3, height as i64, width as i64],
            input.into_raw_vec(),
        ))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        let (shape, probabilities) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<i64> = shape.iter().copied().collect();
        let (mask_w, mask_h) = map_dimensions(&dims)?;

        self.preprocessor.to_mask(probabilities, mask_w, mask_h)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
