//! The single live connection to one physical or composite camera
//!
//! Two counters live here. The *external* count is the number of open
//! [`Camera`](super::Camera) handles and is the only thing that decides when the device is
//! torn down: exactly once, on its 1 -> 0 transition. The *internal* count
//! tracks the crate's own structural references (capture sessions) and never
//! keeps the device open by itself.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use super::handle::{Camera, StateCallback};
use super::name::CameraName;
use super::switchable::{CompositeCapture, SwitchableBacking};
use super::webcam::WebcamBacking;
use crate::capture::session::{CaptureCallback, CaptureSession};
use crate::capture::worker::{self, CaptureWorker, ErrorSink, SharedNative};
use crate::capture::{
    CameraCharacteristics, CaptureRequest, CaptureSequenceId, ControlKind, ControlValue,
    NativeCamera,
};
use crate::continuation::Continuation;
use crate::error::{CameraError, Result};
use crate::usb::UsbDevice;
use crate::utils::lock;

/// External count value once teardown has begun; no reference can be added
/// after it is set.
const TORN_DOWN: usize = usize::MAX;

type TeardownHook = Box<dyn FnOnce() + Send>;

pub(crate) enum Backing {
    Webcam(WebcamBacking),
    Switchable(SwitchableBacking),
    Closed,
}

/// Where device queries and control changes go: the webcam's own native
/// camera, or the active member of a composite.
enum ControlTarget {
    Native(SharedNative),
    Member(Camera),
}

fn control_target(backing: &Backing) -> Result<ControlTarget> {
    match backing {
        Backing::Webcam(webcam) => webcam.native().map(ControlTarget::Native),
        Backing::Switchable(composite) => composite.active_member().map(ControlTarget::Member),
        Backing::Closed => Err(CameraError::DeviceClosed),
    }
}

/// Things taken out of a backing under its lock, released after the lock is
/// dropped. Releasing them can join capture threads whose callbacks may call
/// back into the same camera.
#[derive(Default)]
pub(crate) struct Retired {
    pub(crate) captures: Vec<CompositeCapture>,
    pub(crate) workers: Vec<CaptureWorker>,
    pub(crate) natives: Vec<SharedNative>,
}

pub struct RefCountedCamera {
    this: Weak<RefCountedCamera>,
    name: CameraName,
    external: AtomicUsize,
    internal: AtomicUsize,
    open: AtomicBool,
    /// Bumped by every new session and by teardown; stale sessions are refused.
    generation: AtomicU64,
    backing: Mutex<Backing>,
    state: Mutex<Option<Continuation<dyn StateCallback>>>,
    teardown_hooks: Mutex<Vec<TeardownHook>>,
    buffer_count: usize,
}

impl RefCountedCamera {
    fn with_backing(
        name: CameraName,
        backing: Backing,
        state: Option<Continuation<dyn StateCallback>>,
        buffer_count: usize,
    ) -> Arc<Self> {
        metrics::gauge!("robocam_cameras_open").increment(1.0);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            name,
            external: AtomicUsize::new(0),
            internal: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            backing: Mutex::new(backing),
            state: Mutex::new(state),
            teardown_hooks: Mutex::new(Vec::new()),
            buffer_count,
        })
    }

    pub(crate) fn webcam(
        name: CameraName,
        backing: WebcamBacking,
        state: Option<Continuation<dyn StateCallback>>,
        buffer_count: usize,
    ) -> Arc<Self> {
        Self::with_backing(name, Backing::Webcam(backing), state, buffer_count)
    }

    pub(crate) fn switchable(
        name: CameraName,
        backing: SwitchableBacking,
        state: Option<Continuation<dyn StateCallback>>,
        buffer_count: usize,
    ) -> Arc<Self> {
        Self::with_backing(name, Backing::Switchable(backing), state, buffer_count)
    }

    pub fn name(&self) -> &CameraName {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn external_ref_count(&self) -> usize {
        match self.external.load(Ordering::Acquire) {
            TORN_DOWN => 0,
            count => count,
        }
    }

    pub fn internal_ref_count(&self) -> usize {
        self.internal.load(Ordering::Acquire)
    }

    /// Take one external reference. Fails once the device has been torn down.
    pub fn add_ref_external(&self) -> Result<usize> {
        let mut current = self.external.load(Ordering::Acquire);
        loop {
            if current == TORN_DOWN {
                return Err(CameraError::DeviceClosed);
            }
            match self.external.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one external reference, tearing the device down when it was the
    /// last. Returns the number still held.
    ///
    /// # Panics
    ///
    /// If called more often than [`add_ref_external`](Self::add_ref_external).
    pub fn release_ref_external(&self) -> usize {
        let mut current = self.external.load(Ordering::Acquire);
        loop {
            assert!(
                current != 0 && current != TORN_DOWN,
                "{}: external reference released more times than it was added",
                self.name
            );
            let next = if current == 1 { TORN_DOWN } else { current - 1 };
            match self.external.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if next == TORN_DOWN => {
                    self.teardown();
                    return 0;
                }
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn add_ref_internal(&self) -> usize {
        self.internal.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// # Panics
    ///
    /// If no internal reference is held.
    pub fn release_ref_internal(&self) -> usize {
        let previous = self
            .internal
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match previous {
            Ok(previous) => previous - 1,
            Err(_) => panic!(
                "{}: internal reference released more times than it was added",
                self.name
            ),
        }
    }

    /// Run `hook` when the device is torn down, or now if it already was.
    pub(crate) fn on_teardown(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = lock(&self.teardown_hooks);
        if self.is_open() {
            hooks.push(Box::new(hook));
        } else {
            drop(hooks);
            hook();
        }
    }

    /// The USB device currently backing a webcam
    pub fn usb_device(&self) -> Option<UsbDevice> {
        match &*lock(&self.backing) {
            Backing::Webcam(webcam) => Some(webcam.device().clone()),
            _ => None,
        }
    }

    fn check_current(&self, generation: u64) -> Result<()> {
        if !self.is_open() || self.generation.load(Ordering::Acquire) != generation {
            return Err(CameraError::DeviceClosed);
        }
        Ok(())
    }

    pub(crate) fn begin_session(&self) -> Result<CaptureSession> {
        let this = self
            .this
            .upgrade()
            .filter(|camera| camera.is_open())
            .ok_or(CameraError::DeviceClosed)?;

        let mut retired = Retired::default();
        let generation = {
            let mut backing = lock(&self.backing);
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            match &mut *backing {
                Backing::Webcam(webcam) => webcam.end_capture(&mut retired),
                Backing::Switchable(composite) => retired.captures.extend(composite.take_capture(None)),
                Backing::Closed => {}
            }
            generation
        };
        drop(retired);

        debug!("{}: session {} created", self.name, generation);
        Ok(CaptureSession::new(InternalRef::new(this), generation))
    }

    pub(crate) fn start_capture(
        &self,
        generation: u64,
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        callback: Arc<dyn CaptureCallback>,
    ) -> Result<()> {
        if matches!(&*lock(&self.backing), Backing::Switchable(_)) {
            return self.start_composite_capture(generation, request, sequence_id, callback);
        }

        let mut retired = Retired::default();
        let result = {
            let mut backing = lock(&self.backing);
            self.check_current(generation)?;
            match &mut *backing {
                Backing::Webcam(webcam) => webcam.start_capture(
                    generation,
                    request,
                    sequence_id,
                    callback,
                    self.buffer_count,
                    self.error_sink(),
                    &mut retired,
                ),
                _ => Err(CameraError::DeviceClosed),
            }
        };
        drop(retired);
        result
    }

    /// Member sessions are started without holding this camera's lock.
    fn start_composite_capture(
        &self,
        generation: u64,
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        callback: Arc<dyn CaptureCallback>,
    ) -> Result<()> {
        let (member, numberer, previous) = {
            let mut backing = lock(&self.backing);
            self.check_current(generation)?;
            let Backing::Switchable(composite) = &mut *backing else {
                return Err(CameraError::DeviceClosed);
            };
            (
                composite.active_member()?,
                composite.numberer(),
                composite.take_capture(None),
            )
        };
        drop(previous);

        let capture = CompositeCapture::start(&member, request, sequence_id, callback, numberer)?;
        self.install_composite_capture(generation, capture)
    }

    fn install_composite_capture(&self, generation: u64, capture: CompositeCapture) -> Result<()> {
        let installed = {
            let mut backing = lock(&self.backing);
            match &mut *backing {
                Backing::Switchable(composite) if self.check_current(generation).is_ok() => {
                    Ok(composite.install(capture))
                }
                _ => Err(capture),
            }
        };
        match installed {
            Ok(replaced) => {
                drop(replaced);
                Ok(())
            }
            Err(stale) => {
                drop(stale);
                Err(CameraError::DeviceClosed)
            }
        }
    }

    pub(crate) fn stop_capture(&self, sequence_id: CaptureSequenceId) {
        let mut retired = Retired::default();
        {
            let mut backing = lock(&self.backing);
            match &mut *backing {
                Backing::Webcam(webcam) => webcam.stop_capture(sequence_id, &mut retired),
                Backing::Switchable(composite) => {
                    retired.captures.extend(composite.take_capture(Some(sequence_id)))
                }
                Backing::Closed => {}
            }
        }
        drop(retired);
    }

    pub(crate) fn members(&self) -> Result<Vec<CameraName>> {
        match &*lock(&self.backing) {
            Backing::Switchable(composite) => Ok(composite.member_names()),
            Backing::Webcam(_) => Err(CameraError::Unsupported(self.name.clone())),
            Backing::Closed => Err(CameraError::DeviceClosed),
        }
    }

    pub(crate) fn active_camera(&self) -> Result<CameraName> {
        match &*lock(&self.backing) {
            Backing::Switchable(composite) => Ok(composite.active_name()),
            Backing::Webcam(_) => Err(CameraError::Unsupported(self.name.clone())),
            Backing::Closed => Err(CameraError::DeviceClosed),
        }
    }

    pub(crate) fn characteristics(&self) -> Result<CameraCharacteristics> {
        let target = control_target(&lock(&self.backing))?;
        match target {
            ControlTarget::Native(native) => lock(&native).native().characteristics(),
            ControlTarget::Member(member) => member.characteristics(),
        }
    }

    pub(crate) fn control(&self, kind: ControlKind) -> Result<ControlValue> {
        let target = control_target(&lock(&self.backing))?;
        match target {
            ControlTarget::Native(native) => lock(&native).native().control(kind),
            ControlTarget::Member(member) => member.control(kind),
        }
    }

    /// Apply `value` now and remember it. A composite records it before
    /// applying, so a concurrent switch still carries it to the new member.
    pub(crate) fn set_control(&self, value: ControlValue) -> Result<()> {
        let target = {
            let mut backing = lock(&self.backing);
            if let Backing::Switchable(composite) = &mut *backing {
                composite.remember(value);
            }
            control_target(&backing)?
        };
        match target {
            ControlTarget::Native(native) => {
                lock(&native).native().set_control(value)?;
                if let Backing::Webcam(webcam) = &mut *lock(&self.backing) {
                    webcam.remember(value);
                }
                Ok(())
            }
            ControlTarget::Member(member) => member.set_control(value),
        }
    }

    /// Make `name` the active member and bring it to the composite's control
    /// settings. A running capture moves to it without resetting frame
    /// numbers. If the new member cannot stream, the capture stops and the
    /// error is returned; the member stays active.
    pub(crate) fn set_active_camera(&self, name: &CameraName) -> Result<()> {
        let generation = self.generation.load(Ordering::Acquire);
        let (previous, member, numberer, controls) = {
            let mut backing = lock(&self.backing);
            let composite = match &mut *backing {
                Backing::Switchable(composite) => composite,
                Backing::Webcam(_) => return Err(CameraError::Unsupported(self.name.clone())),
                Backing::Closed => return Err(CameraError::DeviceClosed),
            };
            let index = composite
                .index_of(name)
                .ok_or_else(|| CameraError::NotAMember(name.clone()))?;
            if index == composite.active_index() {
                return Ok(());
            }
            composite.set_active_index(index);
            info!("{}: active camera is now {}", self.name, name);
            let member = composite.active_member()?;
            (
                composite.take_capture(None),
                member,
                composite.numberer(),
                composite.controls_to_replay(),
            )
        };

        for value in controls {
            if let Err(err) = member.set_control(value) {
                warn!("{}: {} did not take {:?}: {}", self.name, name, value, err);
            }
        }
        let Some(previous) = previous else {
            return Ok(());
        };

        let (sequence_id, request, callback) = (
            previous.sequence_id,
            previous.request,
            Arc::clone(&previous.callback),
        );
        debug!("{}: moving capture off {}", self.name, previous.member());
        drop(previous);

        let capture = CompositeCapture::start(&member, request, sequence_id, callback, numberer)?;
        self.install_composite_capture(generation, capture)
    }

    fn error_sink(&self) -> ErrorSink {
        let this = self.this.clone();
        Box::new(move |error| {
            if let Some(camera) = this.upgrade() {
                camera.capture_failed(error);
            }
        })
    }

    fn capture_failed(&self, error: CameraError) {
        match error {
            CameraError::Disconnected => {
                self.mark_disconnected(None);
            }
            error => self.report_error(error),
        }
    }

    /// Release the native resource of a webcam whose device went away.
    /// `device_name` restricts this to one device node.
    pub(crate) fn mark_disconnected(&self, device_name: Option<&str>) -> bool {
        let mut retired = Retired::default();
        let changed = match &mut *lock(&self.backing) {
            Backing::Webcam(webcam) => webcam.disconnect(device_name, &mut retired),
            _ => false,
        };
        drop(retired);

        if changed {
            warn!("{}: device disconnected", self.name);
            metrics::counter!("robocam_camera_disconnects_total").increment(1);
            self.report_error(CameraError::Disconnected);
        }
        changed
    }

    pub(crate) fn awaiting_reattach(&self) -> bool {
        self.is_open()
            && match &*lock(&self.backing) {
                Backing::Webcam(webcam) => webcam.awaiting_reattach(),
                _ => false,
            }
    }

    /// Adopt a reopened native camera after the device came back
    pub(crate) fn reattach(&self, device: UsbDevice, native: Box<dyn NativeCamera>) -> bool {
        let mut retired = Retired::default();
        let device_name = device.device_name.clone();
        let result = match &mut *lock(&self.backing) {
            Backing::Webcam(webcam) if self.is_open() => webcam.reattach(
                device,
                native,
                self.generation.load(Ordering::Acquire),
                self.buffer_count,
                self.error_sink(),
                &mut retired,
            ),
            _ => {
                retired.natives.push(worker::share(native));
                Ok(false)
            }
        };
        drop(retired);

        match result {
            Ok(true) => {
                info!("{}: reattached as {}", self.name, device_name);
                metrics::counter!("robocam_camera_reattaches_total").increment(1);
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!("{}: capture did not resume after reattach: {}", self.name, err);
                self.report_error(err);
                true
            }
        }
    }

    fn report_error(&self, error: CameraError) {
        if let Some(state) = lock(&self.state).as_ref() {
            let name = self.name.clone();
            state.dispatch(move |callback| callback.on_error(&name, &error));
        }
    }

    fn teardown(&self) {
        self.open.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);

        let backing = std::mem::replace(&mut *lock(&self.backing), Backing::Closed);
        drop(backing);

        let hooks = std::mem::take(&mut *lock(&self.teardown_hooks));
        for hook in hooks {
            hook();
        }

        metrics::counter!("robocam_camera_teardowns_total").increment(1);
        metrics::gauge!("robocam_cameras_open").decrement(1.0);
        info!("{}: closed", self.name);

        if let Some(state) = lock(&self.state).take() {
            let name = self.name.clone();
            state.dispatch(move |callback| callback.on_closed(&name));
        }
    }
}

/// One internal reference, released on drop
pub struct InternalRef {
    camera: Arc<RefCountedCamera>,
}

impl InternalRef {
    pub fn new(camera: Arc<RefCountedCamera>) -> Self {
        camera.add_ref_internal();
        Self { camera }
    }
}

impl Deref for InternalRef {
    type Target = RefCountedCamera;

    fn deref(&self) -> &Self::Target {
        &self.camera
    }
}

impl Drop for InternalRef {
    fn drop(&mut self) {
        self.camera.release_ref_internal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::name::SerialNumber;
    use crate::capture::RawFrameInfo;

    struct Inert {
        drops: Arc<AtomicUsize>,
    }

    impl NativeCamera for Inert {
        fn start_streaming(&mut self, request: &CaptureRequest) -> Result<CaptureRequest> {
            Ok(*request)
        }

        fn read_frame(&mut self, _buffer: &mut Vec<u8>) -> Result<RawFrameInfo> {
            Err(CameraError::Disconnected)
        }

        fn stop_streaming(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl Drop for Inert {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn camera() -> (Arc<RefCountedCamera>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let device = UsbDevice {
            device_name: "/dev/video0".into(),
            vendor_id: 1,
            product_id: 2,
            serial_number: Some("S".into()),
            connection_path: Some("1-1".into()),
        };
        let backing = WebcamBacking::new(
            device,
            Box::new(Inert {
                drops: Arc::clone(&drops),
            }),
            std::time::Duration::ZERO,
        );
        let camera = RefCountedCamera::webcam(
            CameraName::webcam(SerialNumber::usb("S")),
            backing,
            None,
            2,
        );
        (camera, drops)
    }

    #[test]
    fn test_teardown_exactly_once_on_last_release() {
        let (camera, drops) = camera();
        assert_eq!(camera.add_ref_external().unwrap(), 1);
        assert_eq!(camera.add_ref_external().unwrap(), 2);

        assert_eq!(camera.release_ref_external(), 1);
        assert!(camera.is_open());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert_eq!(camera.release_ref_external(), 0);
        assert!(!camera.is_open());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        assert!(matches!(
            camera.add_ref_external(),
            Err(CameraError::DeviceClosed)
        ));
    }

    #[test]
    #[should_panic(expected = "released more times")]
    fn test_over_release_is_fatal() {
        let (camera, _) = camera();
        camera.add_ref_external().unwrap();
        camera.release_ref_external();
        camera.release_ref_external();
    }

    #[test]
    fn test_internal_refs_do_not_keep_device_open() {
        let (camera, drops) = camera();
        camera.add_ref_external().unwrap();
        let internal = InternalRef::new(Arc::clone(&camera));
        assert_eq!(camera.internal_ref_count(), 1);

        camera.release_ref_external();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!internal.is_open());

        drop(internal);
        assert_eq!(camera.internal_ref_count(), 0);
    }

    #[test]
    fn test_teardown_hooks_run_once() {
        let (camera, _) = camera();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        camera.on_teardown(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        camera.add_ref_external().unwrap();
        camera.release_ref_external();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&runs);
        camera.on_teardown(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disconnect_releases_native_once() {
        let (camera, drops) = camera();
        camera.add_ref_external().unwrap();

        assert!(!camera.mark_disconnected(Some("/dev/video9")));
        assert!(camera.mark_disconnected(Some("/dev/video0")));
        assert!(!camera.mark_disconnected(None));
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        // Zero reopen window: never waits for the device to come back
        assert!(!camera.awaiting_reattach());
        camera.release_ref_external();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
