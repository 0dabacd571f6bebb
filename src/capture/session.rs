//! Capture sessions: the consumer-facing lifecycle of a frame stream

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::frame::{CaptureRequest, CaptureSequenceId, Frame};
use crate::camera::name::CameraName;
use crate::camera::refcount::InternalRef;
use crate::error::{CameraError, Result};
use crate::utils::lock;

/// Receives the frames of one capture.
///
/// Frames are delivered on the capture thread. The frame is only borrowed for
/// the duration of the call; use [`Frame::copy_boxed`] to keep one.
pub trait CaptureCallback: Send + Sync {
    fn on_new_frame(&self, frame: &dyn Frame);

    fn on_session_closed(&self) {}
}

struct Running {
    sequence_id: CaptureSequenceId,
    callback: Arc<dyn CaptureCallback>,
}

/// A session holds one internal reference on its camera. Creating a newer
/// session on the same camera supersedes this one; closing or dropping it
/// stops any capture it started.
pub struct CaptureSession {
    camera: InternalRef,
    generation: u64,
    closed: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl CaptureSession {
    pub(crate) fn new(camera: InternalRef, generation: u64) -> Self {
        Self {
            camera,
            generation,
            closed: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn camera_name(&self) -> &CameraName {
        self.camera.name()
    }

    /// Start streaming into `callback`, replacing any capture this session
    /// already runs.
    pub fn start_capturing(
        &self,
        request: CaptureRequest,
        callback: Arc<dyn CaptureCallback>,
    ) -> Result<CaptureSequenceId> {
        if self.is_closed() {
            return Err(CameraError::DeviceClosed);
        }
        let sequence_id = CaptureSequenceId::next();
        let previous = lock(&self.running).take();
        if let Some(previous) = previous {
            self.camera.stop_capture(previous.sequence_id);
        }
        self.camera.start_capture(
            self.generation,
            request,
            sequence_id,
            Arc::clone(&callback),
        )?;
        *lock(&self.running) = Some(Running {
            sequence_id,
            callback,
        });
        info!(
            "{}: capture {} started ({} @ {} fps)",
            self.camera.name(),
            sequence_id.get(),
            request.size,
            request.fps
        );
        Ok(sequence_id)
    }

    pub fn stop_capturing(&self) {
        let previous = lock(&self.running).take();
        if let Some(previous) = previous {
            self.camera.stop_capture(previous.sequence_id);
            debug!(
                "{}: capture {} stopped",
                self.camera.name(),
                previous.sequence_id.get()
            );
        }
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous = lock(&self.running).take();
        if let Some(previous) = previous {
            self.camera.stop_capture(previous.sequence_id);
            previous.callback.on_session_closed();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}
