use super::types::{ResolutionHint, SegmentationMask, SharedEngine};
use crate::error::EffectError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

/// A frame copied out of the render path for segmentation
pub struct MaskRequest {
    pub seq: u64,
    pub frame: image::RgbaImage,
    pub hint: ResolutionHint,
}

/// Outcome of one segmentation call
pub struct MaskResponse {
    pub seq: u64,
    pub result: Result<SegmentationMask, EffectError>,
    pub elapsed: Duration,
}

/// Why no response is available right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Pending,
    Gone,
}

/// Background thread that owns segmentation calls for one session
///
/// Dropping the worker closes its request channel. A call already running is
/// not interrupted; the thread exits after it and its response is dropped.
pub struct SegmentationWorker {
    requests: Sender<MaskRequest>,
    responses: Receiver<MaskResponse>,
}

impl SegmentationWorker {
    pub fn spawn(engine: SharedEngine) -> Result<Self, EffectError> {
        let (request_tx, request_rx) = channel::bounded::<MaskRequest>(1);
        let (response_tx, response_rx) = channel::bounded::<MaskResponse>(1);

        thread::Builder::new()
            .name("segmentation".into())
            .spawn(move || run_worker(engine, request_rx, response_tx))
            .map_err(|e| EffectError::EffectStart(format!("failed to spawn segmentation worker: {e}")))?;

        Ok(Self {
            requests: request_tx,
            responses: response_rx,
        })
    }

    /// Hand a request to the worker without blocking
    pub fn submit(&self, request: MaskRequest) -> Result<(), EffectError> {
        self.requests.try_send(request).map_err(|e| {
            EffectError::SegmentationFailed(format!("segmentation worker unavailable: {e}"))
        })
    }

    pub fn try_response(&self) -> Result<MaskResponse, WorkerStatus> {
        self.responses.try_recv().map_err(|e| match e {
            TryRecvError::Empty => WorkerStatus::Pending,
            TryRecvError::Disconnected => WorkerStatus::Gone,
        })
    }

    pub fn wait_response(&self, timeout: Duration) -> Result<MaskResponse, WorkerStatus> {
        self.responses.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WorkerStatus::Pending,
            RecvTimeoutError::Disconnected => WorkerStatus::Gone,
        })
    }
}

fn run_worker(engine: SharedEngine, requests: Receiver<MaskRequest>, responses: Sender<MaskResponse>) {
    tracing::debug!("Segmentation worker started");

    for request in requests.iter() {
        let start = Instant::now();
        let result = {
            let mut engine = engine.lock();
            let _span = tracing::debug_span!("segment", seq = request.seq, engine = engine.name()).entered();
            panic::catch_unwind(AssertUnwindSafe(|| engine.segment(&request.frame, request.hint)))
        };

        let result = match result {
            Ok(Ok(mask)) => Ok(mask),
            Ok(Err(e)) => Err(EffectError::SegmentationFailed(format!("{e:#}"))),
            Err(_) => Err(EffectError::SegmentationFailed("segmentation engine panicked".into())),
        };

        let response = MaskResponse {
            seq: request.seq,
            result,
            elapsed: start.elapsed(),
        };

        if responses.send(response).is_err() {
            tracing::debug!(seq = request.seq, "Session ended, dropping segmentation result");
            break;
        }
    }

    tracing::debug!("Segmentation worker stopped");
}
