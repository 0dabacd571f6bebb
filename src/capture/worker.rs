//! Capture thread pulling frames from a native camera into a session callback

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use super::buffers::BufferPool;
use super::frame::{CameraFrame, CaptureRequest, CaptureSequenceId, FrameMetadata};
use super::session::CaptureCallback;
use super::NativeCamera;
use crate::error::{CameraError, Result};
use crate::utils::lock;

const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// A native camera plus the capture sequence currently streaming from it.
pub(crate) struct NativeSlot {
    native: Box<dyn NativeCamera>,
    streaming: Option<CaptureSequenceId>,
}

impl NativeSlot {
    pub(crate) fn native(&mut self) -> &mut dyn NativeCamera {
        self.native.as_mut()
    }

    fn stop_if_streaming(&mut self, sequence_id: CaptureSequenceId) {
        if self.streaming == Some(sequence_id) {
            self.streaming = None;
            if let Err(err) = self.native.stop_streaming() {
                debug!("stop_streaming failed: {}", err);
            }
        }
    }
}

pub(crate) type SharedNative = Arc<Mutex<NativeSlot>>;

pub(crate) fn share(native: Box<dyn NativeCamera>) -> SharedNative {
    Arc::new(Mutex::new(NativeSlot {
        native,
        streaming: None,
    }))
}

/// Receives errors that ended a capture
pub(crate) type ErrorSink = Box<dyn Fn(CameraError) + Send>;

/// One running capture. Dropping it stops the stream and joins the thread,
/// unless it is dropped from inside one of its own frame callbacks.
pub(crate) struct CaptureWorker {
    sequence_id: CaptureSequenceId,
    running: Arc<AtomicBool>,
    native: SharedNative,
    thread: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub(crate) fn start(
        native: &SharedNative,
        request: &CaptureRequest,
        sequence_id: CaptureSequenceId,
        callback: Arc<dyn CaptureCallback>,
        buffer_count: usize,
        on_error: ErrorSink,
    ) -> Result<Self> {
        let negotiated = {
            let mut slot = lock(native);
            if let Some(previous) = slot.streaming {
                debug!("preempting capture sequence {}", previous.get());
                slot.stop_if_streaming(previous);
            }
            let negotiated = slot.native.start_streaming(request)?;
            slot.streaming = Some(sequence_id);
            negotiated
        };

        let pool = BufferPool::new(
            buffer_count,
            negotiated.format.max_frame_bytes(negotiated.size),
        );
        let running = Arc::new(AtomicBool::new(true));

        let spawned = thread::Builder::new()
            .name(format!("capture-{}", sequence_id.get()))
            .spawn({
                let native = Arc::clone(native);
                let running = Arc::clone(&running);
                move || {
                    capture_loop(
                        &native,
                        &running,
                        negotiated,
                        sequence_id,
                        callback.as_ref(),
                        &pool,
                        &on_error,
                    )
                }
            });

        match spawned {
            Ok(thread) => Ok(Self {
                sequence_id,
                running,
                native: Arc::clone(native),
                thread: Some(thread),
            }),
            Err(err) => {
                lock(native).stop_if_streaming(sequence_id);
                Err(err.into())
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        lock(&self.native).stop_if_streaming(self.sequence_id);

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                // Stopped from inside a frame callback; the loop exits on return.
                return;
            }
            if thread.join().is_err() {
                error!("capture thread {} panicked", self.sequence_id.get());
            }
        }
    }
}

fn capture_loop(
    native: &SharedNative,
    running: &AtomicBool,
    request: CaptureRequest,
    sequence_id: CaptureSequenceId,
    callback: &dyn CaptureCallback,
    pool: &Arc<BufferPool>,
    on_error: &ErrorSink,
) {
    debug!(
        "capture {} started: {:?} {} @ {} fps",
        sequence_id.get(),
        request.format,
        request.size,
        request.fps
    );
    let mut frame_number = 0u64;
    let mut scratch = Vec::new();
    let mut consecutive_errors = 0;

    while running.load(Ordering::Acquire) {
        let mut pooled = pool.acquire();
        let result = {
            let mut slot = lock(native);
            if slot.streaming != Some(sequence_id) {
                break;
            }
            match pooled.as_mut() {
                Some(buffer) => slot.native.read_frame(&mut **buffer),
                None => {
                    scratch.clear();
                    slot.native.read_frame(&mut scratch)
                }
            }
        };

        match result {
            Ok(info) => {
                consecutive_errors = 0;
                let Some(buffer) = pooled else {
                    // Every buffer is still held by a frame downstream
                    metrics::counter!("robocam_frames_dropped_total").increment(1);
                    trace!("dropped frame {}: buffer pool exhausted", info.sequence);
                    continue;
                };
                frame_number += 1;
                let meta = FrameMetadata {
                    frame_number,
                    size: request.size,
                    stride: info.stride,
                    format: request.format,
                    capture_time: Instant::now(),
                    device_timestamp: info.device_timestamp,
                };
                let frame = CameraFrame::pooled(request, sequence_id, meta, buffer);
                if panic::catch_unwind(AssertUnwindSafe(|| callback.on_new_frame(&frame))).is_err()
                {
                    error!("frame callback panicked on frame {}", frame_number);
                }
            }
            Err(CameraError::Disconnected) => {
                warn!("capture {}: device disconnected", sequence_id.get());
                on_error(CameraError::Disconnected);
                break;
            }
            Err(err) => {
                consecutive_errors += 1;
                warn!("capture {}: {}", sequence_id.get(), err);
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    on_error(err);
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    lock(native).stop_if_streaming(sequence_id);
    debug!(
        "capture {} finished after {} frames",
        sequence_id.get(),
        frame_number
    );
}
