use crate::capture::Geometry;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbaImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Create a connected feed/stream pair
///
/// `capacity` frames are buffered; when the consumer falls behind, new frames
/// are dropped instead of queueing.
pub fn output_channel(geometry: Geometry, capacity: usize) -> (OutputFeed, OutputStream) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let live = Arc::new(AtomicBool::new(true));
    (
        OutputFeed {
            frames: tx,
            live: live.clone(),
            dropped: 0,
        },
        OutputStream {
            frames: rx,
            live,
            geometry,
        },
    )
}

/// Producer side, owned by the effect session
pub struct OutputFeed {
    frames: Sender<RgbaImage>,
    live: Arc<AtomicBool>,
    dropped: u64,
}

impl OutputFeed {
    /// Publish a composited frame; returns false if it was dropped
    pub fn publish(&mut self, frame: &RgbaImage) -> bool {
        match self.frames.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::trace!(dropped = self.dropped, "Output consumer lagging, frame dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Mark the stream as ended; further frames are never delivered
    pub fn release(self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

impl Drop for OutputFeed {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Composited video handed to the host as the replacement camera track
pub struct OutputStream {
    frames: Receiver<RgbaImage>,
    live: Arc<AtomicBool>,
    geometry: Geometry,
}

impl OutputStream {
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Whether the producing session is still running
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Next frame, waiting up to `timeout`
    pub fn next_frame(&self, timeout: Duration) -> Option<RgbaImage> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_frame(&self) -> Option<RgbaImage> {
        self.frames.try_recv().ok()
    }

    /// Drop buffered frames and return the newest one
    pub fn latest_frame(&self) -> Option<RgbaImage> {
        self.frames.try_iter().last()
    }
}
