//! Frames re-stamped into one logical sequence
//!
//! A switchable camera feeds frames from several physical sources, each with
//! its own counter, into a single stream. The composing layer owns a
//! [`FrameNumberer`] and wraps every inner frame in a [`RenumberedCameraFrame`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::frame::{CameraFrame, CaptureRequest, CaptureSequenceId, Frame, PixelFormat, Size};

/// Hands out strictly increasing, duplicate-free frame numbers starting at 1
#[derive(Debug)]
pub struct FrameNumberer {
    next: AtomicU64,
}

impl Default for FrameNumberer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameNumberer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_number(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Wrap `inner` with the next number in this sequence
    pub fn renumber(
        &self,
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        inner: &CameraFrame,
    ) -> RenumberedCameraFrame {
        RenumberedCameraFrame::new(request, sequence_id, inner, self.next_number())
    }
}

/// A frame with its own frame number, request and sequence identity, holding
/// one structural reference on the inner frame for as long as it lives.
pub struct RenumberedCameraFrame {
    request: CaptureRequest,
    sequence_id: CaptureSequenceId,
    inner: CameraFrame,
    frame_number: u64,
}

impl RenumberedCameraFrame {
    pub fn new(
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        inner: &CameraFrame,
        frame_number: u64,
    ) -> Self {
        Self {
            request,
            sequence_id,
            inner: inner.clone(),
            frame_number,
        }
    }

    pub fn inner(&self) -> &CameraFrame {
        &self.inner
    }

    /// Same frame number, content detached from the live pipeline
    pub fn copy(&self) -> RenumberedCameraFrame {
        let inner_copy = self.inner.copy();
        Self::new(
            self.request,
            self.sequence_id,
            &inner_copy,
            self.frame_number,
        )
    }
}

impl Frame for RenumberedCameraFrame {
    fn request(&self) -> &CaptureRequest {
        &self.request
    }

    fn capture_sequence_id(&self) -> CaptureSequenceId {
        self.sequence_id
    }

    fn frame_number(&self) -> u64 {
        self.frame_number
    }

    fn size(&self) -> Size {
        self.inner.size()
    }

    fn format(&self) -> PixelFormat {
        self.inner.format()
    }

    fn stride(&self) -> u32 {
        self.inner.stride()
    }

    fn capture_time(&self) -> Instant {
        self.inner.capture_time()
    }

    fn image_buffer(&self) -> &[u8] {
        self.inner.image_buffer()
    }

    fn underlying(&self) -> &CameraFrame {
        &self.inner
    }

    fn copy_boxed(&self) -> Box<dyn Frame> {
        Box::new(self.copy())
    }
}

impl fmt::Debug for RenumberedCameraFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenumberedCameraFrame")
            .field("frame_number", &self.frame_number)
            .field("sequence_id", &self.sequence_id)
            .field("inner", &self.inner)
            .finish()
    }
}
