//! Streaming state of a single USB webcam, including recovery after unplug

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::capture::session::CaptureCallback;
use crate::capture::worker::{self, CaptureWorker, ErrorSink, SharedNative};
use crate::capture::{CaptureRequest, CaptureSequenceId, ControlCache, ControlValue, NativeCamera};
use crate::error::{CameraError, Result};
use crate::usb::UsbDevice;
use crate::utils::lock;

use super::refcount::Retired;

/// A capture to restart if the device comes back
#[derive(Clone)]
struct Resume {
    generation: u64,
    request: CaptureRequest,
    sequence_id: CaptureSequenceId,
    callback: Arc<dyn CaptureCallback>,
}

pub(crate) struct WebcamBacking {
    // Dropped before `native`
    worker: Option<CaptureWorker>,
    native: Option<SharedNative>,
    device: UsbDevice,
    resume: Option<Resume>,
    disconnected_at: Option<Instant>,
    reopen_window: Duration,
    /// Applied again when a reopened device is adopted
    controls: ControlCache,
}

impl WebcamBacking {
    pub(crate) fn new(
        device: UsbDevice,
        native: Box<dyn NativeCamera>,
        reopen_window: Duration,
    ) -> Self {
        Self {
            worker: None,
            native: Some(worker::share(native)),
            device,
            resume: None,
            disconnected_at: None,
            reopen_window,
            controls: ControlCache::default(),
        }
    }

    pub(crate) fn device(&self) -> &UsbDevice {
        &self.device
    }

    pub(crate) fn native(&self) -> Result<SharedNative> {
        self.native.clone().ok_or(CameraError::Disconnected)
    }

    pub(crate) fn remember(&mut self, value: ControlValue) {
        self.controls.record(value);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_capture(
        &mut self,
        generation: u64,
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        callback: Arc<dyn CaptureCallback>,
        buffer_count: usize,
        on_error: ErrorSink,
        retired: &mut Retired,
    ) -> Result<()> {
        self.end_capture(retired);
        let native = self.native.as_ref().ok_or(CameraError::Disconnected)?;
        let worker = CaptureWorker::start(
            native,
            &request,
            sequence_id,
            Arc::clone(&callback),
            buffer_count,
            on_error,
        )?;
        self.worker = Some(worker);
        self.resume = Some(Resume {
            generation,
            request,
            sequence_id,
            callback,
        });
        Ok(())
    }

    pub(crate) fn stop_capture(&mut self, sequence_id: CaptureSequenceId, retired: &mut Retired) {
        if self
            .resume
            .as_ref()
            .is_some_and(|resume| resume.sequence_id == sequence_id)
        {
            self.end_capture(retired);
        }
    }

    pub(crate) fn end_capture(&mut self, retired: &mut Retired) {
        self.resume = None;
        retired.workers.extend(self.worker.take());
    }

    /// Drop the native resource after the device went away. `device_name`
    /// limits this to a specific node. Returns whether anything changed.
    pub(crate) fn disconnect(&mut self, device_name: Option<&str>, retired: &mut Retired) -> bool {
        if device_name.is_some_and(|name| name != self.device.device_name) {
            return false;
        }
        let Some(native) = self.native.take() else {
            return false;
        };
        retired.workers.extend(self.worker.take());
        retired.natives.push(native);
        self.disconnected_at = Some(Instant::now());
        true
    }

    /// Disconnected, and still within the window in which it may be reopened
    pub(crate) fn awaiting_reattach(&self) -> bool {
        self.native.is_none()
            && self
                .disconnected_at
                .is_some_and(|at| at.elapsed() <= self.reopen_window)
    }

    /// Adopt a freshly opened native camera for the same identity and resume
    /// the capture that was running when the device disappeared.
    pub(crate) fn reattach(
        &mut self,
        device: UsbDevice,
        native: Box<dyn NativeCamera>,
        current_generation: u64,
        buffer_count: usize,
        on_error: ErrorSink,
        retired: &mut Retired,
    ) -> Result<bool> {
        let native = worker::share(native);
        if !self.awaiting_reattach() {
            retired.natives.push(native);
            return Ok(false);
        }
        {
            let mut slot = lock(&native);
            for value in self.controls.replay() {
                if let Err(err) = slot.native().set_control(value) {
                    warn!("{}: could not restore {:?}: {}", device.device_name, value, err);
                }
            }
        }
        self.device = device;
        self.native = Some(Arc::clone(&native));
        self.disconnected_at = None;

        match self.resume.clone() {
            Some(resume) if resume.generation == current_generation => {
                let started = CaptureWorker::start(
                    &native,
                    &resume.request,
                    resume.sequence_id,
                    resume.callback,
                    buffer_count,
                    on_error,
                );
                match started {
                    Ok(worker) => self.worker = Some(worker),
                    Err(err) => {
                        self.resume = None;
                        return Err(err);
                    }
                }
            }
            _ => self.resume = None,
        }
        Ok(true)
    }
}
