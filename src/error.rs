use thiserror::Error;

/// Errors surfaced by the background effect pipeline
///
/// Structural errors (`InvalidStream`, `EffectStart`, `StreamDetached`) end the
/// session. Per-cycle errors (`SegmentationFailed`, `BackgroundLoad`) are
/// absorbed by the pipeline and only reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("input stream has no video track")]
    InvalidStream,

    #[error("failed to start background effect: {0}")]
    EffectStart(String),

    #[error("input stream was detached")]
    StreamDetached,

    #[error("segmentation failed: {0}")]
    SegmentationFailed(String),

    #[error("failed to load background '{selection}': {reason}")]
    BackgroundLoad { selection: String, reason: String },
}

impl EffectError {
    /// Whether this error terminates the running session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EffectError::InvalidStream | EffectError::EffectStart(_) | EffectError::StreamDetached
        )
    }
}

/// Errors reported by a capture source when asked for a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The underlying device or track is gone for good
    #[error("capture source detached")]
    Detached,

    /// A single read failed; the next one may succeed
    #[error("frame read failed: {0}")]
    Read(String),
}
