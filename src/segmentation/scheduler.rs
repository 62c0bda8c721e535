use super::types::{ResolutionHint, SegmentationMask, SharedEngine};
use super::worker::{MaskRequest, MaskResponse, SegmentationWorker, WorkerStatus};
use crate::error::EffectError;
use image::RgbaImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RequestInFlight { seq: u64, since: Instant },
}

/// What a scheduler tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A new segmentation request was handed to the worker
    Dispatched { seq: u64 },
    /// A request is still outstanding
    Busy,
    /// The scheduler has been stopped
    Stopped,
    /// The worker could not take the request
    Unavailable,
}

/// How an outstanding request resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Stored { seq: u64, elapsed: Duration },
    Failed { seq: u64, consecutive: u32, error: EffectError },
    /// Arrived after `stop()` or did not match the request in flight
    Discarded { seq: u64 },
}

/// Drives segmentation at its own cadence and keeps the freshest mask
///
/// At most one request is outstanding at any time; ticks that arrive while a
/// request is in flight are dropped rather than queued.
pub struct MaskScheduler {
    worker: SegmentationWorker,
    hint: ResolutionHint,
    state: SchedulerState,
    active: bool,
    next_seq: u64,
    latest: Option<Arc<SegmentationMask>>,
    completed: u64,
    consecutive_failures: u32,
}

impl MaskScheduler {
    pub fn new(engine: SharedEngine, hint: ResolutionHint) -> Result<Self, EffectError> {
        let worker = SegmentationWorker::spawn(engine)?;
        Ok(Self {
            worker,
            hint,
            state: SchedulerState::Idle,
            active: true,
            next_seq: 1,
            latest: None,
            completed: 0,
            consecutive_failures: 0,
        })
    }

    /// Timer callback
    pub fn tick(&mut self, frame: &RgbaImage) -> TickOutcome {
        if !self.active {
            return TickOutcome::Stopped;
        }

        if let SchedulerState::RequestInFlight { .. } = self.state {
            if self.collect().is_none() {
                return TickOutcome::Busy;
            }
        }

        let seq = self.next_seq;
        let request = MaskRequest {
            seq,
            frame: frame.clone(),
            hint: self.hint,
        };

        if let Err(e) = self.worker.submit(request) {
            tracing::warn!("Segmentation request not dispatched: {}", e);
            return TickOutcome::Unavailable;
        }

        self.next_seq += 1;
        self.state = SchedulerState::RequestInFlight {
            seq,
            since: Instant::now(),
        };
        tracing::trace!(seq, "Segmentation request dispatched");
        TickOutcome::Dispatched { seq }
    }

    /// Take a finished response, if any, without blocking
    pub fn collect(&mut self) -> Option<Completion> {
        if !self.is_in_flight() {
            return None;
        }
        match self.worker.try_response() {
            Ok(response) => Some(self.accept(response)),
            Err(WorkerStatus::Pending) => None,
            Err(WorkerStatus::Gone) => Some(self.worker_lost()),
        }
    }

    /// Block until the outstanding request resolves or `timeout` passes
    pub fn wait_for_completion(&mut self, timeout: Duration) -> Option<Completion> {
        if !self.is_in_flight() {
            return None;
        }
        match self.worker.wait_response(timeout) {
            Ok(response) => Some(self.accept(response)),
            Err(WorkerStatus::Pending) => None,
            Err(WorkerStatus::Gone) => Some(self.worker_lost()),
        }
    }

    fn accept(&mut self, response: MaskResponse) -> Completion {
        let in_flight = match self.state {
            SchedulerState::RequestInFlight { seq, .. } => Some(seq),
            SchedulerState::Idle => None,
        };
        self.state = SchedulerState::Idle;

        if !self.active || in_flight != Some(response.seq) {
            tracing::debug!(seq = response.seq, "Discarding stale segmentation result");
            return Completion::Discarded { seq: response.seq };
        }

        match response.result {
            Ok(mask) => {
                tracing::debug!(
                    seq = response.seq,
                    "Mask {}x{} ready in {:.1}ms",
                    mask.width(),
                    mask.height(),
                    response.elapsed.as_secs_f64() * 1000.0
                );
                self.latest = Some(Arc::new(mask));
                self.completed += 1;
                self.consecutive_failures = 0;
                Completion::Stored {
                    seq: response.seq,
                    elapsed: response.elapsed,
                }
            }
            Err(error) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    seq = response.seq,
                    consecutive = self.consecutive_failures,
                    "Keeping previous mask: {}",
                    error
                );
                Completion::Failed {
                    seq: response.seq,
                    consecutive: self.consecutive_failures,
                    error,
                }
            }
        }
    }

    fn worker_lost(&mut self) -> Completion {
        let seq = match self.state {
            SchedulerState::RequestInFlight { seq, .. } => seq,
            SchedulerState::Idle => 0,
        };
        self.state = SchedulerState::Idle;
        self.consecutive_failures += 1;
        let error = EffectError::SegmentationFailed("segmentation worker exited".into());
        tracing::error!("{}", error);
        Completion::Failed {
            seq,
            consecutive: self.consecutive_failures,
            error,
        }
    }

    /// Freshest completed mask, `None` before the first completion
    pub fn latest_mask(&self) -> Option<Arc<SegmentationMask>> {
        self.latest.clone()
    }

    /// Stop accepting work; a response still in flight will be discarded
    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, SchedulerState::RequestInFlight { .. })
    }

    /// Number of masks stored so far
    pub fn completed_cycles(&self) -> u64 {
        self.completed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn hint(&self) -> ResolutionHint {
        self.hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::{share_engine, SegmentationEngine};
    use anyhow::anyhow;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    type Reply = Result<SegmentationMask, String>;

    /// Engine whose calls block until the test releases them
    struct GatedEngine {
        gate: Receiver<Reply>,
        calls: Arc<AtomicUsize>,
    }

    impl SegmentationEngine for GatedEngine {
        fn segment(&mut self, _frame: &RgbaImage, _hint: ResolutionHint) -> anyhow::Result<SegmentationMask> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.gate.recv() {
                Ok(Ok(mask)) => Ok(mask),
                Ok(Err(reason)) => Err(anyhow!(reason)),
                Err(_) => Err(anyhow!("gate closed")),
            }
        }
    }

    fn scheduler() -> (MaskScheduler, Sender<Reply>, Arc<AtomicUsize>) {
        let (gate_tx, gate_rx) = channel::unbounded();
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = GatedEngine {
            gate: gate_rx,
            calls: calls.clone(),
        };
        let scheduler = MaskScheduler::new(share_engine(engine), ResolutionHint::default()).unwrap();
        (scheduler, gate_tx, calls)
    }

    fn mask(value: bool) -> SegmentationMask {
        SegmentationMask::from_fn(2, 2, |_, _| value)
    }

    #[test]
    fn test_no_mask_before_first_completion() {
        let (mut scheduler, _gate, _calls) = scheduler();
        assert!(scheduler.latest_mask().is_none());
        assert!(matches!(
            scheduler.tick(&RgbaImage::new(4, 4)),
            TickOutcome::Dispatched { seq: 1 }
        ));
        assert!(scheduler.latest_mask().is_none());
    }

    #[test]
    fn test_ticks_while_in_flight_are_dropped() {
        let (mut scheduler, gate, calls) = scheduler();
        let frame = RgbaImage::new(4, 4);

        assert!(matches!(scheduler.tick(&frame), TickOutcome::Dispatched { .. }));
        for _ in 0..10 {
            assert_eq!(scheduler.tick(&frame), TickOutcome::Busy);
        }

        gate.send(Ok(mask(true))).unwrap();
        assert!(matches!(
            scheduler.wait_for_completion(WAIT),
            Some(Completion::Stored { seq: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_failure_keeps_previous_mask() {
        let (mut scheduler, gate, _calls) = scheduler();
        let frame = RgbaImage::new(4, 4);

        scheduler.tick(&frame);
        gate.send(Ok(mask(true))).unwrap();
        scheduler.wait_for_completion(WAIT);

        scheduler.tick(&frame);
        gate.send(Err("model error".into())).unwrap();
        let completion = scheduler.wait_for_completion(WAIT);
        assert!(matches!(
            completion,
            Some(Completion::Failed { seq: 2, consecutive: 1, .. })
        ));
        assert_eq!(*scheduler.latest_mask().unwrap(), mask(true));
        assert_eq!(scheduler.completed_cycles(), 1);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let (mut scheduler, gate, _calls) = scheduler();
        let frame = RgbaImage::new(4, 4);

        for expected in 1..=3 {
            scheduler.tick(&frame);
            gate.send(Err("boom".into())).unwrap();
            scheduler.wait_for_completion(WAIT);
            assert_eq!(scheduler.consecutive_failures(), expected);
        }

        scheduler.tick(&frame);
        gate.send(Ok(mask(false))).unwrap();
        scheduler.wait_for_completion(WAIT);
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[test]
    fn test_latest_mask_is_newest_result() {
        let (mut scheduler, gate, _calls) = scheduler();
        let frame = RgbaImage::new(4, 4);

        for n in 1..=5u32 {
            scheduler.tick(&frame);
            gate.send(Ok(SegmentationMask::from_fn(n, 1, |_, _| true))).unwrap();
            scheduler.wait_for_completion(WAIT);
            assert_eq!(scheduler.latest_mask().unwrap().width(), n);
        }
        assert_eq!(scheduler.completed_cycles(), 5);
    }

    #[test]
    fn test_result_after_stop_is_discarded() {
        let (mut scheduler, gate, _calls) = scheduler();
        let frame = RgbaImage::new(4, 4);

        scheduler.tick(&frame);
        gate.send(Ok(mask(true))).unwrap();
        scheduler.wait_for_completion(WAIT);
        let before = scheduler.latest_mask();

        scheduler.tick(&frame);
        scheduler.stop();
        gate.send(Ok(mask(false))).unwrap();

        assert!(matches!(
            scheduler.wait_for_completion(WAIT),
            Some(Completion::Discarded { seq: 2 })
        ));
        assert_eq!(scheduler.latest_mask(), before);
        assert_eq!(scheduler.tick(&frame), TickOutcome::Stopped);
    }

    struct PanickingEngine;

    impl SegmentationEngine for PanickingEngine {
        fn segment(&mut self, _frame: &RgbaImage, _hint: ResolutionHint) -> anyhow::Result<SegmentationMask> {
            panic!("model crashed");
        }
    }

    #[test]
    fn test_engine_panic_is_a_failed_cycle() {
        let mut scheduler =
            MaskScheduler::new(share_engine(PanickingEngine), ResolutionHint::default()).unwrap();
        scheduler.tick(&RgbaImage::new(4, 4));
        assert!(matches!(
            scheduler.wait_for_completion(WAIT),
            Some(Completion::Failed { consecutive: 1, .. })
        ));
        assert!(matches!(
            scheduler.tick(&RgbaImage::new(4, 4)),
            TickOutcome::Dispatched { seq: 2 }
        ));
    }
}
