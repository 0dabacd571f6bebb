pub mod buffers;
pub mod controls;
pub mod frame;
pub mod renumber;
pub mod session;
pub(crate) mod worker;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::time::Duration;

use crate::error::{CameraError, Result};

pub use buffers::{BufferPool, PooledBuffer};
pub use controls::{
    CameraCharacteristics, CameraMode, ControlCache, ControlKind, ControlValue, ExposureMode,
    FocusMode,
};
pub use frame::{
    CameraFrame, CaptureRequest, CaptureSequenceId, Frame, FrameMetadata, PixelFormat, Size,
};
pub use renumber::{FrameNumberer, RenumberedCameraFrame};
pub use session::{CaptureCallback, CaptureSession};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Camera;

/// What the device reported about one dequeued frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrameInfo {
    /// Device-side sequence counter
    pub sequence: u64,
    pub bytes_used: usize,
    pub stride: u32,
    pub device_timestamp: Option<Duration>,
}

/// The platform streaming resource behind one opened webcam.
///
/// Dropping it releases the device.
pub trait NativeCamera: Send {
    /// Configure and start streaming. Returns the request the device actually
    /// accepted, which may differ from the one asked for.
    fn start_streaming(&mut self, request: &CaptureRequest) -> Result<CaptureRequest>;

    /// Block until the next frame is available and append it to `buffer`.
    ///
    /// Returns [`CameraError::Disconnected`](crate::CameraError::Disconnected)
    /// once the device has gone away.
    fn read_frame(&mut self, buffer: &mut Vec<u8>) -> Result<RawFrameInfo>;

    fn stop_streaming(&mut self) -> Result<()>;

    /// Formats, sizes and frame rates the device can stream
    fn characteristics(&mut self) -> Result<CameraCharacteristics> {
        Ok(CameraCharacteristics::default())
    }

    fn control(&mut self, kind: ControlKind) -> Result<ControlValue> {
        Err(CameraError::ControlUnsupported(kind))
    }

    fn set_control(&mut self, value: ControlValue) -> Result<()> {
        Err(CameraError::ControlUnsupported(value.kind()))
    }
}
