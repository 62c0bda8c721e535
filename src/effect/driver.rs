use super::controller::BackgroundEffectController;
use crate::compositor::BackgroundSource;
use crate::error::EffectError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Render ticks between statistics log lines
const STATS_EVERY_TICKS: u64 = 150;

/// Requests accepted by a running driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    Stop,
    SetBackground(BackgroundSource),
}

/// Why `EffectDriver::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// A `Stop` command ended the effect
    Stopped,
    /// The controller was not (or no longer) running
    NotRunning,
}

/// Thread-safe handle for steering a driver from elsewhere
#[derive(Debug, Clone)]
pub struct DriverHandle {
    commands: Sender<DriverCommand>,
}

impl DriverHandle {
    pub fn stop(&self) -> bool {
        self.commands.send(DriverCommand::Stop).is_ok()
    }

    pub fn set_background(&self, source: BackgroundSource) -> bool {
        self.commands.send(DriverCommand::SetBackground(source)).is_ok()
    }
}

/// Cooperative loop firing the render and segmentation timers
///
/// Both callbacks run on the calling thread and never overlap. Segmentation
/// itself runs on the session's worker thread, so a slow model only delays
/// the next mask, never a render tick.
pub struct EffectDriver {
    commands: Receiver<DriverCommand>,
    handle: DriverHandle,
}

impl Default for EffectDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectDriver {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            commands: rx,
            handle: DriverHandle { commands: tx },
        }
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle.clone()
    }

    /// Run until stopped, the input detaches, or the controller stops itself
    pub fn run(&self, controller: &mut BackgroundEffectController) -> Result<DriverExit, EffectError> {
        let Some(geometry) = controller.geometry() else {
            return Ok(DriverExit::NotRunning);
        };

        let render_interval = geometry.frame_interval();
        let mask_interval = controller.settings().mask_interval.max(Duration::from_millis(1));

        tracing::info!(
            "Driver running: render every {:.1}ms, segmentation every {}ms",
            render_interval.as_secs_f64() * 1000.0,
            mask_interval.as_millis()
        );

        let start = Instant::now();
        let mut next_render = start;
        let mut next_mask = start;
        let mut ticks = 0u64;

        while controller.is_enabled() {
            let now = Instant::now();

            if now >= next_render {
                match controller.render_tick() {
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::warn!("Render tick failed: {}", e),
                    Ok(_) => {}
                }
                next_render = advance(next_render, render_interval, now);

                ticks += 1;
                if ticks % STATS_EVERY_TICKS == 0 {
                    log_stats(controller, ticks);
                }
            }

            if now >= next_mask {
                match controller.mask_tick() {
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => tracing::warn!("Segmentation tick failed: {}", e),
                    Ok(_) => {}
                }
                next_mask = advance(next_mask, mask_interval, now);
            }

            match self.commands.recv_deadline(next_render.min(next_mask)) {
                Ok(DriverCommand::Stop) => {
                    controller.stop();
                    return Ok(DriverExit::Stopped);
                }
                Ok(DriverCommand::SetBackground(source)) => {
                    if let Err(e) = controller.set_background(source) {
                        tracing::debug!("Background command ignored: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }

        Ok(DriverExit::NotRunning)
    }
}

/// Next deadline, skipping ticks that were missed instead of bursting them
fn advance(previous: Instant, interval: Duration, now: Instant) -> Instant {
    let next = previous + interval;
    if next <= now {
        now + interval
    } else {
        next
    }
}

fn log_stats(controller: &BackgroundEffectController, ticks: u64) {
    if let Some(stats) = controller.stats() {
        tracing::info!(
            "Frame {}: composited={}, passthrough={}, masks={}/{}, render={:.1}ms, dropped={}",
            ticks,
            stats.composited_frames,
            stats.passthrough_frames,
            stats.masks_completed,
            stats.masks_requested,
            stats.average_render_ms(),
            stats.dropped_frames
        );
    }
}
