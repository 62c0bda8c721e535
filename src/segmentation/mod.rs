mod onnx;
mod preprocess;
mod scheduler;
pub mod types;
mod worker;

pub use onnx::OnnxPersonSegmenter;
pub use preprocess::Preprocessor;
pub use scheduler::{Completion, MaskScheduler, SchedulerState, TickOutcome};
pub use types::{share_engine, ResolutionHint, SegmentationEngine, SegmentationMask, SharedEngine};
pub use worker::SegmentationWorker;

use anyhow::Result;

/// Create the default segmentation engine (ONNX person segmentation)
pub fn create_default_engine(model_path: &str, threshold: f32) -> Result<SharedEngine> {
    let engine = OnnxPersonSegmenter::new(model_path, threshold)?;
    Ok(share_engine(engine))
}
