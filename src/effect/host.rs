use crate::capture::MediaStream;
use crate::error::EffectError;
use crate::output::OutputStream;

/// Supplies the live camera stream the effect runs on
pub trait VideoSourceProvider {
    fn camera_stream(&mut self) -> Result<MediaStream, EffectError>;
}

/// The host's outgoing local video track
pub trait LocalTrackSink {
    /// Send `stream` in place of the camera
    fn replace_video_track(&mut self, stream: OutputStream) -> Result<(), EffectError>;

    /// Go back to sending the unprocessed camera
    fn restore_camera_track(&mut self) -> Result<(), EffectError>;
}
