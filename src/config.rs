use crate::segmentation::ResolutionHint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Segmentation cadence used when nothing else is configured
pub const DEFAULT_MASK_INTERVAL: Duration = Duration::from_millis(200);

/// Render rate used when the camera does not report one
pub const FALLBACK_FRAME_RATE: f64 = 30.0;

/// Consecutive failed segmentation cycles before the effect is reported as degraded
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

/// Probability above which a pixel is classified as person
pub const DEFAULT_SEGMENTATION_THRESHOLD: f32 = 0.7;

/// Mask quality / CPU cost tradeoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    /// Internal resolution the segmentation model works at
    pub fn resolution_hint(self) -> ResolutionHint {
        match self {
            Quality::Low => ResolutionHint::new(0.25),
            Quality::Medium => ResolutionHint::new(0.5),
            Quality::High => ResolutionHint::new(0.75),
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(format!("unknown quality '{other}', expected low, medium or high")),
        }
    }
}

/// Configuration surface exposed to the UI layer
///
/// ```json
/// { "enabled": true, "backgroundSelection": "blur:12", "quality": "high" }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EffectConfig {
    pub enabled: bool,
    pub background_selection: String,
    pub quality: Quality,
}

impl EffectConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Pipeline tuning owned by the controller
#[derive(Debug, Clone, PartialEq)]
pub struct EffectSettings {
    pub quality: Quality,
    /// Period of the segmentation timer
    pub mask_interval: Duration,
    /// Render rate when the input reports none
    pub fallback_frame_rate: f64,
    /// Consecutive failures before a degraded notice
    pub degraded_after: u32,
    /// Frames buffered between the compositor and the output consumer
    pub output_buffer: usize,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            mask_interval: DEFAULT_MASK_INTERVAL,
            fallback_frame_rate: FALLBACK_FRAME_RATE,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            output_buffer: 2,
        }
    }
}

impl EffectSettings {
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_mask_interval(mut self, interval: Duration) -> Self {
        self.mask_interval = interval;
        self
    }

    pub fn with_degraded_after(mut self, failures: u32) -> Self {
        self.degraded_after = failures;
        self
    }

    /// Fallback rate guaranteed positive and finite
    pub fn effective_fallback_frame_rate(&self) -> f64 {
        if self.fallback_frame_rate.is_finite() && self.fallback_frame_rate > 0.0 {
            self.fallback_frame_rate
        } else {
            FALLBACK_FRAME_RATE
        }
    }
}
