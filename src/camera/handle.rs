//! The consumer-facing camera handle

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::name::CameraName;
use super::refcount::RefCountedCamera;
use crate::capture::{
    CameraCharacteristics, CaptureRequest, CaptureSession, ControlKind, ControlValue, PixelFormat,
    Size,
};
use crate::error::{CameraError, OpenFailure, Result};

/// Lifecycle notifications for a camera, delivered through a continuation.
pub trait StateCallback: Send + Sync {
    /// The callee owns `camera` and must eventually close (or drop) it.
    fn on_opened(&self, camera: Camera);

    fn on_open_failed(&self, name: &CameraName, failure: OpenFailure);

    /// The device behind a camera opened through this callback was torn down.
    fn on_closed(&self, _name: &CameraName) {}

    fn on_error(&self, _name: &CameraName, _error: &CameraError) {}
}

/// One external reference on an open camera.
///
/// Handles are independent: closing one never affects another, and the
/// device is released when the last of them closes. Dropping a handle closes
/// it.
pub struct Camera {
    camera: Arc<RefCountedCamera>,
    closed: AtomicBool,
}

impl Camera {
    pub(crate) fn new(camera: Arc<RefCountedCamera>) -> Result<Self> {
        camera.add_ref_external()?;
        Ok(Self {
            camera,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &CameraName {
        self.camera.name()
    }

    /// A new, independently closeable handle on the same device
    pub fn dup(&self) -> Result<Camera> {
        Camera::new(Arc::clone(self.live()?))
    }

    /// Release this handle's reference. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining = self.camera.release_ref_external();
        debug!("{}: handle closed, {} remaining", self.name(), remaining);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of open handles on the device behind this one
    pub fn external_ref_count(&self) -> usize {
        self.camera.external_ref_count()
    }

    fn live(&self) -> Result<&Arc<RefCountedCamera>> {
        if self.is_closed() || !self.camera.is_open() {
            return Err(CameraError::DeviceClosed);
        }
        Ok(&self.camera)
    }

    pub fn create_capture_request(
        &self,
        format: PixelFormat,
        size: Size,
        fps: u32,
    ) -> Result<CaptureRequest> {
        self.live()?;
        if size.width == 0 || size.height == 0 || fps == 0 {
            return Err(CameraError::stream(format!(
                "invalid capture request {size} @ {fps} fps"
            )));
        }
        Ok(CaptureRequest::new(format, size, fps))
    }

    /// Open a capture session. Any earlier session on the same device is
    /// superseded and its capture stopped.
    pub fn create_capture_session(&self) -> Result<CaptureSession> {
        self.live()?.begin_session()
    }

    /// Member cameras of a switchable camera
    pub fn members(&self) -> Result<Vec<CameraName>> {
        self.live()?.members()
    }

    pub fn active_camera(&self) -> Result<CameraName> {
        self.live()?.active_camera()
    }

    pub fn set_active_camera(&self, name: &CameraName) -> Result<()> {
        self.live()?.set_active_camera(name)
    }

    /// Formats, sizes and frame rates the device can stream. For a switchable
    /// camera, those of the active member.
    pub fn characteristics(&self) -> Result<CameraCharacteristics> {
        self.live()?.characteristics()
    }

    /// Current value of an exposure or focus control, read from the device
    pub fn control(&self, kind: ControlKind) -> Result<ControlValue> {
        self.live()?.control(kind)
    }

    /// Change an exposure or focus control. The setting is kept and applied
    /// again to a webcam that is reattached, or to a switchable camera's
    /// member when it becomes active.
    pub fn set_control(&self, value: ControlValue) -> Result<()> {
        self.live()?.set_control(value)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("name", self.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}
