use anyhow::{Context, Result};
use backdrop::capture::{CaptureSource, MediaStream, WebcamCapture};
use backdrop::compositor::BackgroundSource;
use backdrop::config::{EffectConfig, EffectSettings, Quality, DEFAULT_SEGMENTATION_THRESHOLD};
use backdrop::effect::{
    BackgroundEffectController, DriverExit, EffectDriver, EffectEvent, LocalTrackSink,
    VideoSourceProvider,
};
use backdrop::error::EffectError;
use backdrop::output::{OutputSink, OutputStream, V4L2Output};
use backdrop::segmentation;
use clap::Parser;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to segmentation model (ONNX file)
    /// If not provided, runs in passthrough mode without segmentation
    #[arg(long)]
    model: Option<String>,

    /// Background: an image path, "blur" or "blur:<sigma>"
    #[arg(short, long)]
    background: Option<String>,

    /// Mask quality: low, medium or high
    #[arg(long)]
    quality: Option<Quality>,

    /// Milliseconds between segmentation requests
    #[arg(long, default_value_t = 200)]
    mask_interval_ms: u64,

    /// Person probability threshold
    #[arg(long, default_value_t = DEFAULT_SEGMENTATION_THRESHOLD)]
    threshold: f32,

    /// JSON effect configuration ({"enabled", "backgroundSelection", "quality"})
    #[arg(long)]
    config: Option<String>,
}

impl Args {
    /// Merge the optional JSON file with command line overrides
    fn effect_config(&self) -> Result<EffectConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                EffectConfig::from_json(&json)
                    .with_context(|| format!("Invalid effect configuration in {}", path))?
            }
            None => EffectConfig {
                enabled: self.model.is_some(),
                ..EffectConfig::default()
            },
        };

        if let Some(background) = &self.background {
            config.background_selection = background.clone();
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if self.model.is_none() {
            config.enabled = false;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = args.effect_config()?;

    tracing::info!("Backdrop starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Target FPS: {}", args.fps);
    tracing::info!("Quality: {:?}", config.quality);

    let capture = WebcamCapture::new(
        args.input_device,
        args.capture_width,
        args.capture_height,
        args.fps,
    )
    .context("Failed to initialize webcam capture")?;

    let output = V4L2Output::new(&args.output_device, args.capture_width, args.capture_height)
        .context("Failed to initialize v4l2loopback output")?;

    let model = match (&args.model, config.enabled) {
        (Some(path), true) => path,
        _ => {
            tracing::info!("Running in passthrough mode (no segmentation)");
            return run_passthrough(capture, output, args.fps);
        }
    };

    let engine = segmentation::create_default_engine(model, args.threshold)
        .context("Failed to load segmentation model")?;

    let settings = EffectSettings::default()
        .with_quality(config.quality)
        .with_mask_interval(Duration::from_millis(args.mask_interval_ms));

    let mut controller = BackgroundEffectController::new(engine, settings);
    spawn_event_logger(controller.subscribe());

    if let Some(source) = BackgroundSource::from_selection(&config.background_selection) {
        if let Err(e) = controller.set_background(source) {
            tracing::warn!("Starting without a background: {}", e);
        }
    } else {
        tracing::warn!("No background selected, video will pass through");
    }

    let mut provider = CameraProvider {
        capture: Some(capture),
    };
    let mut sink = LoopbackSink {
        output: Some(output),
        forwarder: None,
    };

    controller
        .toggle(true, &mut provider, &mut sink)
        .context("Failed to enable background effect")?;

    tracing::info!("Press Ctrl+C to stop");

    let driver = EffectDriver::new();
    let exit = driver.run(&mut controller);

    controller
        .toggle(false, &mut provider, &mut sink)
        .context("Failed to disable background effect")?;

    match exit {
        Ok(DriverExit::Stopped) | Ok(DriverExit::NotRunning) => Ok(()),
        Err(e) => Err(e).context("Background effect ended"),
    }
}

/// Hands the webcam over once, for the effect session to own
struct CameraProvider {
    capture: Option<WebcamCapture>,
}

impl VideoSourceProvider for CameraProvider {
    fn camera_stream(&mut self) -> Result<MediaStream, EffectError> {
        let capture = self.capture.take().ok_or(EffectError::InvalidStream)?;
        Ok(MediaStream::new().with_video(capture))
    }
}

/// Forwards the effect stream to the loopback device on its own thread
struct LoopbackSink {
    output: Option<V4L2Output>,
    forwarder: Option<JoinHandle<V4L2Output>>,
}

impl LocalTrackSink for LoopbackSink {
    fn replace_video_track(&mut self, stream: OutputStream) -> Result<(), EffectError> {
        let mut output = self
            .output
            .take()
            .ok_or_else(|| EffectError::EffectStart("loopback output already in use".into()))?;

        let forwarder = std::thread::Builder::new()
            .name("loopback".into())
            .spawn(move || {
                while stream.is_live() {
                    if let Some(frame) = stream.next_frame(Duration::from_millis(100)) {
                        if let Err(e) = output.write_frame(&frame) {
                            tracing::warn!("Dropping output frame: {:#}", e);
                        }
                    }
                }
                tracing::debug!("Loopback forwarder wrote {} frames", output.frames_written());
                output
            })
            .map_err(|e| EffectError::EffectStart(format!("failed to spawn loopback forwarder: {e}")))?;

        self.forwarder = Some(forwarder);
        Ok(())
    }

    fn restore_camera_track(&mut self) -> Result<(), EffectError> {
        if let Some(forwarder) = self.forwarder.take() {
            match forwarder.join() {
                Ok(output) => self.output = Some(output),
                Err(_) => tracing::error!("Loopback forwarder panicked"),
            }
        }
        Ok(())
    }
}

fn spawn_event_logger(events: crossbeam::channel::Receiver<EffectEvent>) {
    std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                EffectEvent::Degraded {
                    consecutive_failures,
                } => tracing::warn!(
                    "Background effect degraded after {} failed segmentations",
                    consecutive_failures
                ),
                EffectEvent::StreamDetached => {
                    tracing::error!("Camera disconnected, background effect stopped")
                }
                EffectEvent::BackgroundLoadFailed { selection, reason } => {
                    tracing::warn!("Background {} unavailable: {}", selection, reason)
                }
                other => tracing::debug!("Effect event: {:?}", other),
            }
        }
    });
}

/// Camera straight to loopback, no effect
fn run_passthrough<C, O>(mut capture: C, mut output: O, target_fps: u32) -> Result<()>
where
    C: CaptureSource,
    O: OutputSink,
{
    let frame_duration = Duration::from_secs_f32(1.0 / target_fps.max(1) as f32);
    let mut frame_count = 0u64;

    tracing::info!("Press Ctrl+C to stop");

    loop {
        let loop_start = Instant::now();

        match capture.poll_frame() {
            Ok(Some(frame)) => {
                output
                    .write_frame(&frame)
                    .context("Failed to write frame")?;
                frame_count += 1;
            }
            Ok(None) => {}
            Err(e) => return Err(e).context("Failed to capture frame"),
        }

        if frame_count > 0 && frame_count % 300 == 0 {
            tracing::info!("Frame {}: passthrough", frame_count);
        }

        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }
}
