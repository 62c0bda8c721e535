use super::host::{LocalTrackSink, VideoSourceProvider};
use super::EffectEvent;
use crate::capture::{FrameSource, Geometry, MediaStream, TrackKind};
use crate::compositor::{
    BackgroundLoader, BackgroundSource, Compositor, FsBackgroundLoader, LoadedBackground, RenderMode,
};
use crate::config::EffectSettings;
use crate::error::EffectError;
use crate::output::{output_channel, OutputFeed, OutputStream};
use crate::segmentation::{MaskScheduler, SegmentationMask, SharedEngine, TickOutcome};
use crossbeam::channel::{self, Receiver, Sender};
use image::RgbaImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters for one running session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub render_ticks: u64,
    pub composited_frames: u64,
    pub passthrough_frames: u64,
    pub masks_requested: u64,
    pub masks_completed: u64,
    pub dropped_frames: u64,
    pub render_time: Duration,
}

impl SessionStats {
    pub fn average_render_ms(&self) -> f64 {
        if self.render_ticks == 0 {
            return 0.0;
        }
        self.render_time.as_secs_f64() * 1000.0 / self.render_ticks as f64
    }
}

/// Everything that exists only while the effect runs
struct EffectSession {
    source: FrameSource,
    scheduler: MaskScheduler,
    compositor: Compositor,
    feed: OutputFeed,
    geometry: Geometry,
    stats: SessionStats,
    degraded: bool,
}

impl EffectSession {
    fn render(&mut self) -> Result<RenderMode, EffectError> {
        let start = Instant::now();

        self.source.refresh()?;
        self.scheduler.collect();

        let frame = self.source.current_frame()?;
        let mask = self.scheduler.latest_mask();
        let mode = self.compositor.render(frame, mask.as_deref());

        if !self.feed.publish(self.compositor.canvas()) {
            self.stats.dropped_frames = self.feed.dropped_frames();
        }

        self.stats.render_ticks += 1;
        self.stats.render_time += start.elapsed();
        match mode {
            RenderMode::Composited => self.stats.composited_frames += 1,
            RenderMode::Passthrough => self.stats.passthrough_frames += 1,
        }
        self.stats.masks_completed = self.scheduler.completed_cycles();

        Ok(mode)
    }

    fn request_mask(&mut self) -> Result<TickOutcome, EffectError> {
        let frame = self.source.current_frame()?;
        let outcome = self.scheduler.tick(frame);
        if let TickOutcome::Dispatched { .. } = outcome {
            self.stats.masks_requested += 1;
        }
        self.stats.masks_completed = self.scheduler.completed_cycles();
        Ok(outcome)
    }
}

/// Public lifecycle façade of the background effect
///
/// Owns the segmentation engine, the background selection and, while running,
/// the session. Nothing here is global: every piece of state lives in this
/// object and is reached through its accessors.
pub struct BackgroundEffectController {
    engine: SharedEngine,
    settings: EffectSettings,
    loader: Box<dyn BackgroundLoader>,
    background: Option<LoadedBackground>,
    subscribers: Vec<Sender<EffectEvent>>,
    session: Option<EffectSession>,
    /// The host sink carries our output in place of the camera
    track_replaced: bool,
}

impl BackgroundEffectController {
    pub fn new(engine: SharedEngine, settings: EffectSettings) -> Self {
        Self {
            engine,
            settings,
            loader: Box::new(FsBackgroundLoader),
            background: None,
            subscribers: Vec::new(),
            session: None,
            track_replaced: false,
        }
    }

    pub fn with_loader<L: BackgroundLoader + 'static>(mut self, loader: L) -> Self {
        self.loader = Box::new(loader);
        self
    }

    /// Receive lifecycle and health notices
    pub fn subscribe(&mut self) -> Receiver<EffectEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: EffectEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Whether the effect can run on `stream`: it needs a camera video track
    pub fn can_apply_to(stream: &MediaStream) -> bool {
        stream
            .first_video()
            .is_some_and(|track| track.kind() == TrackKind::Camera)
    }

    /// Start processing `stream` and return the composited replacement stream
    ///
    /// A running session is stopped first; geometry is never renegotiated
    /// inside a session.
    pub fn start(&mut self, stream: MediaStream) -> Result<OutputStream, EffectError> {
        if self.session.is_some() {
            tracing::info!("Effect already running, restarting with new input");
            self.stop();
        }

        let source = FrameSource::attach(stream, self.settings.effective_fallback_frame_rate())?;
        let geometry = source.geometry();

        let mut compositor = Compositor::new(geometry)?;
        if let Some(background) = &self.background {
            compositor.set_background(background);
        }

        match self.engine.try_lock() {
            Some(mut engine) => engine.reset_state(),
            None => tracing::debug!("Engine busy with a previous session, state not reset"),
        }

        let hint = self.settings.quality.resolution_hint();
        let scheduler = MaskScheduler::new(self.engine.clone(), hint)?;
        let (feed, output) = output_channel(geometry, self.settings.output_buffer);

        tracing::info!(
            "Background effect started: {}x{} @ {:.1} fps, mask every {}ms at {:.0}% resolution",
            geometry.width,
            geometry.height,
            geometry.frame_rate,
            self.settings.mask_interval.as_millis(),
            hint.scale() * 100.0
        );

        self.session = Some(EffectSession {
            source,
            scheduler,
            compositor,
            feed,
            geometry,
            stats: SessionStats::default(),
            degraded: false,
        });
        self.emit(EffectEvent::Started { geometry });

        Ok(output)
    }

    /// Stop the effect and release the output stream
    ///
    /// The input is left alone. Calling this when not running does nothing.
    pub fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.scheduler.stop();
        session.feed.release();

        let stats = &session.stats;
        tracing::info!(
            "Background effect stopped after {} frames ({} composited, {} masks, {:.1}ms avg render)",
            stats.render_ticks,
            stats.composited_frames,
            stats.masks_completed,
            stats.average_render_ms()
        );

        self.emit(EffectEvent::Stopped);
    }

    pub fn is_enabled(&self) -> bool {
        self.session.is_some()
    }

    /// Switch background; takes effect on the next render tick
    ///
    /// If the new source cannot be loaded the previous background stays.
    pub fn set_background(&mut self, source: BackgroundSource) -> Result<(), EffectError> {
        match self.loader.load(&source) {
            Ok(loaded) => {
                if let Some(session) = self.session.as_mut() {
                    session.compositor.set_background(&loaded);
                }
                tracing::info!("Background set to {}", source);
                self.background = Some(loaded);
                self.emit(EffectEvent::BackgroundChanged { source });
                Ok(())
            }
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::warn!("Keeping previous background, {} failed to load: {}", source, reason);
                let selection = source.to_string();
                self.emit(EffectEvent::BackgroundLoadFailed {
                    selection: selection.clone(),
                    reason: reason.clone(),
                });
                Err(EffectError::BackgroundLoad { selection, reason })
            }
        }
    }

    /// Remove the background; video passes through until a new one is set
    pub fn clear_background(&mut self) {
        self.background = None;
        if let Some(session) = self.session.as_mut() {
            session.compositor.clear_background();
        }
    }

    pub fn background(&self) -> Option<BackgroundSource> {
        self.background.as_ref().map(LoadedBackground::source)
    }

    pub fn settings(&self) -> &EffectSettings {
        &self.settings
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.session.as_ref().map(|s| s.geometry)
    }

    /// Freshest mask of the running session; `None` once stopped
    pub fn latest_mask(&self) -> Option<Arc<SegmentationMask>> {
        self.session.as_ref().and_then(|s| s.scheduler.latest_mask())
    }

    /// Segmentation cycles failed in a row, zero when not running
    pub fn consecutive_failures(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(0, |s| s.scheduler.consecutive_failures())
    }

    pub fn stats(&self) -> Option<SessionStats> {
        self.session.as_ref().map(|s| s.stats.clone())
    }

    /// The last composited frame
    pub fn output_canvas(&self) -> Option<&RgbaImage> {
        self.session.as_ref().map(|s| s.compositor.canvas())
    }

    /// Render timer callback
    ///
    /// Returns `Ok(None)` when the effect is not running.
    pub fn render_tick(&mut self) -> Result<Option<RenderMode>, EffectError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        match session.render() {
            Ok(mode) => {
                self.update_health();
                Ok(Some(mode))
            }
            Err(e) => Err(self.session_failed(e)),
        }
    }

    /// Segmentation timer callback
    pub fn mask_tick(&mut self) -> Result<Option<TickOutcome>, EffectError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };

        match session.request_mask() {
            Ok(outcome) => {
                self.update_health();
                Ok(Some(outcome))
            }
            Err(e) => Err(self.session_failed(e)),
        }
    }

    /// The host removed the input stream
    pub fn detach_input(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.source.detach();
            self.session_failed(EffectError::StreamDetached);
        }
    }

    /// Enable or disable the effect on the host's local video track
    ///
    /// On any failure the effect is left disabled.
    pub fn toggle(
        &mut self,
        enabled: bool,
        provider: &mut dyn VideoSourceProvider,
        sink: &mut dyn LocalTrackSink,
    ) -> Result<(), EffectError> {
        if !enabled {
            self.stop();
            if !self.track_replaced {
                return Ok(());
            }
            self.track_replaced = false;
            return sink.restore_camera_track();
        }

        if self.is_enabled() {
            return Ok(());
        }

        // The previous session ended on its own with the host still sending it
        if self.track_replaced {
            self.track_replaced = false;
            sink.restore_camera_track()?;
        }

        let stream = provider.camera_stream()?;
        match stream.first_video() {
            None => return Err(EffectError::InvalidStream),
            Some(track) if track.kind() != TrackKind::Camera => {
                return Err(EffectError::EffectStart(
                    "background effect only applies to camera video".into(),
                ))
            }
            Some(_) => {}
        }

        let output = self.start(stream)?;
        if let Err(e) = sink.replace_video_track(output) {
            tracing::error!("Host rejected the effect track: {}", e);
            self.stop();
            return Err(e);
        }
        self.track_replaced = true;
        Ok(())
    }

    fn session_failed(&mut self, error: EffectError) -> EffectError {
        if error == EffectError::StreamDetached {
            tracing::warn!("Input stream detached, stopping background effect");
            self.emit(EffectEvent::StreamDetached);
            self.stop();
        }
        error
    }

    fn update_health(&mut self) {
        let threshold = self.settings.degraded_after;
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let failures = session.scheduler.consecutive_failures();
        let event = if !session.degraded && threshold > 0 && failures >= threshold {
            session.degraded = true;
            tracing::warn!("Segmentation failed {} times in a row, effect degraded", failures);
            Some(EffectEvent::Degraded {
                consecutive_failures: failures,
            })
        } else if session.degraded && failures == 0 {
            session.degraded = false;
            tracing::info!("Segmentation recovered");
            Some(EffectEvent::Recovered)
        } else {
            None
        };

        if let Some(event) = event {
            self.emit(event);
        }
    }
}

impl Drop for BackgroundEffectController {
    fn drop(&mut self) {
        self.stop();
    }
}
