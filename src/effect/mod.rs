//! Effect lifecycle: the controller façade, its host collaborators and the
//! two-timer driver loop.

mod controller;
mod driver;
mod host;

pub use controller::{BackgroundEffectController, SessionStats};
pub use driver::{DriverCommand, DriverExit, DriverHandle, EffectDriver};
pub use host::{LocalTrackSink, VideoSourceProvider};

use crate::capture::Geometry;
use crate::compositor::BackgroundSource;

/// Notices for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum EffectEvent {
    Started { geometry: Geometry },
    Stopped,
    /// The input went away and the effect stopped itself
    StreamDetached,
    /// Segmentation has failed this many cycles in a row
    Degraded { consecutive_failures: u32 },
    /// A mask was produced again after a degraded period
    Recovered,
    BackgroundChanged { source: BackgroundSource },
    /// The previous background stays in use
    BackgroundLoadFailed { selection: String, reason: String },
}
