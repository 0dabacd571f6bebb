//! Camera enumeration and the permission-then-open pipeline

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::RecvTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::camera::handle::{Camera, StateCallback};
use crate::camera::name::{CameraName, SerialNumber};
use crate::camera::refcount::RefCountedCamera;
use crate::camera::resilient::ReattachWatcher;
use crate::camera::switchable::SwitchableBacking;
use crate::camera::webcam::WebcamBacking;
use crate::continuation::{
    Continuation, ContinuationSynchronizer, Executor, SerialExecutor, Synchronized,
};
use crate::deadline::Deadline;
use crate::error::{CameraError, OpenFailedReason, OpenFailure, Result};
use crate::permission::{PermissionAuthority, PermissionCallback};
use crate::usb::monitor::{UsbAttachmentMonitor, UsbAttachmentSubscriber};
use crate::usb::{self, CameraBackend, UsbDevice};
use crate::{Config, CONFIG};

type OpenResult = std::result::Result<Camera, OpenFailure>;

/// How long a blocking or awaiting caller waits past the deadline for the
/// pipeline's own timeout to arrive
const SETTLE_GRACE: Duration = Duration::from_millis(250);

/// Entry point for finding and opening cameras.
///
/// Cheap to clone; clones share the same executors and monitor.
#[derive(Clone)]
pub struct CameraManager {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn CameraBackend>,
    permissions: Arc<dyn PermissionAuthority>,
    monitor: Arc<UsbAttachmentMonitor>,
    runtime: tokio::runtime::Handle,
    /// Callbacks and composite opens
    general: Arc<dyn Executor>,
    /// USB enumeration and webcam opens, one at a time
    serial: Arc<dyn Executor>,
    config: Arc<Config>,
}

/// The tasks behind [`CameraManager::spawn_hotplug_poller`]
pub struct HotplugTasks {
    pub poller: JoinHandle<()>,
    pub listener: JoinHandle<()>,
}

impl HotplugTasks {
    pub fn abort(&self) {
        self.poller.abort();
        self.listener.abort();
    }
}

impl CameraManager {
    /// A manager using the global [`CONFIG`]
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        permissions: Arc<dyn PermissionAuthority>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        Self::with_config(backend, permissions, runtime, CONFIG.load_full())
    }

    pub fn with_config(
        backend: Arc<dyn CameraBackend>,
        permissions: Arc<dyn PermissionAuthority>,
        runtime: tokio::runtime::Handle,
        config: Arc<Config>,
    ) -> Result<Self> {
        let serial = SerialExecutor::new(config.manager.serial_executor_name.clone())?;
        info!("camera manager ready (open on {})", serial.name());
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                permissions,
                monitor: Arc::new(UsbAttachmentMonitor::new()),
                general: Arc::new(runtime.clone()),
                runtime,
                serial: Arc::new(serial),
                config,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn monitor(&self) -> &Arc<UsbAttachmentMonitor> {
        &self.inner.monitor
    }

    /// The executor callbacks run on unless the caller supplies another
    pub fn general_executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.inner.general)
    }

    /// Convenience for building a state continuation on the general executor
    pub fn continuation(&self, callback: Arc<dyn StateCallback>) -> Continuation<dyn StateCallback> {
        Continuation::new(self.general_executor(), callback)
    }

    fn scan_locked(&self) -> Vec<UsbDevice> {
        match self.inner.backend.attached_devices() {
            Ok(devices) => devices,
            Err(err) => {
                warn!("USB scan failed: {}", err);
                Vec::new()
            }
        }
    }

    pub fn scan_for_usb_devices(&self) -> Vec<UsbDevice> {
        let _scan = usb::scan_lock();
        self.scan_locked()
    }

    /// Identities of the webcams attached right now
    pub fn get_all_webcams(&self) -> Vec<CameraName> {
        self.scan_for_usb_devices()
            .iter()
            .filter_map(UsbDevice::real_or_vendor_product_serial_number)
            .map(CameraName::webcam)
            .collect()
    }

    /// Attached webcams followed by built-in cameras
    pub fn get_all_cameras(&self) -> Vec<CameraName> {
        let mut cameras = self.get_all_webcams();
        cameras.extend(
            self.inner
                .backend
                .builtin_cameras()
                .into_iter()
                .map(CameraName::builtin),
        );
        cameras
    }

    /// The webcam name for `serial`, if exactly one attached device has it
    pub fn webcam_name_from_serial_number(&self, serial: &SerialNumber) -> Option<CameraName> {
        let devices = self.scan_for_usb_devices();
        match usb::find_unique(&devices, serial) {
            Ok(_) => Some(CameraName::webcam(serial.clone())),
            Err(OpenFailure::AmbiguousIdentity(_)) => {
                warn!(
                    "{} matches several attached webcams; address them by port",
                    serial
                );
                None
            }
            Err(_) => None,
        }
    }

    pub fn is_webcam_attached(&self, serial: &SerialNumber) -> bool {
        self.webcam_name_from_serial_number(serial).is_some()
    }

    pub fn name_for_switchable<I>(&self, names: I) -> Result<CameraName>
    where
        I: IntoIterator<Item = CameraName>,
    {
        CameraName::switchable(names)
    }

    /// Poll the bus and feed attach/detach events to [`Self::monitor`]
    pub fn spawn_hotplug_poller(&self, interval: Duration) -> HotplugTasks {
        let _runtime = self.inner.runtime.enter();
        let (events, receiver) = flume::unbounded();
        let listener = Arc::clone(&self.inner.monitor).listen(receiver);
        let poller = usb::spawn_poller(Arc::clone(&self.inner.backend), interval, events);
        HotplugTasks { poller, listener }
    }

    /// Ask for permission to use `name`. A switchable camera is granted only
    /// if every member is; the first denial is reported at once.
    pub fn request_permission(
        &self,
        name: &CameraName,
        deadline: Deadline,
        continuation: Continuation<PermissionCallback>,
    ) {
        let CameraName::Switchable(members) = name else {
            self.inner
                .permissions
                .request_permission(name, deadline, continuation);
            return;
        };

        let all = Arc::new(AllGranted {
            remaining: AtomicUsize::new(members.len()),
            reported: AtomicBool::new(false),
            downstream: continuation,
        });
        for member in members {
            let all = Arc::clone(&all);
            let callback: Arc<PermissionCallback> = Arc::new(move |granted: bool| all.answer(granted));
            self.inner.permissions.request_permission(
                member,
                deadline,
                Continuation::new(self.general_executor(), callback),
            );
        }
    }

    /// Synchronous wrapper over the permission-then-open pipeline.
    ///
    /// Blocks until the camera opens, fails, or `deadline` passes, and returns
    /// `None` in the last two cases. A `continuation`, if given, is told the
    /// outcome as well; on success it receives its own handle, which it must
    /// close independently of the returned one.
    pub fn request_permission_and_open_camera(
        &self,
        deadline: Deadline,
        name: CameraName,
        continuation: Option<Continuation<dyn StateCallback>>,
    ) -> Option<Camera> {
        let sync = Arc::new(ContinuationSynchronizer::new(Deadline::at(
            deadline.instant() + SETTLE_GRACE,
        )));
        let bridge = Arc::new(SyncBridge {
            sync: Arc::clone(&sync),
            forward: continuation.clone(),
        });
        self.request_permission_and_open_camera_async(
            deadline,
            name.clone(),
            self.continuation(bridge),
        );

        match sync.wait() {
            Synchronized::Finished(camera) => camera,
            Synchronized::Expired => {
                // The pipeline never settled; whatever it reports later is dropped
                warn!("{}: no outcome before the deadline", name);
                if let Some(forward) = continuation {
                    forward.dispatch(move |callback| {
                        callback.on_open_failed(&name, OpenFailure::Timeout)
                    });
                }
                None
            }
        }
    }

    /// The pipeline for tokio callers
    pub async fn open_camera(&self, deadline: Deadline, name: CameraName) -> OpenResult {
        let (results, receiver) = flume::bounded(1);
        self.request_permission_and_open_camera_async(
            deadline,
            name,
            self.continuation(Arc::new(ChannelCallback { results })),
        );
        let wait = deadline.remaining() + SETTLE_GRACE;
        match tokio::time::timeout(wait, receiver.recv_async()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OpenFailure::communication("open request abandoned")),
            Err(_) => Err(OpenFailure::Timeout),
        }
    }

    /// Request permission, then open within what is left of `deadline`. The
    /// outcome is reported only through `continuation`, exactly once: if
    /// nothing settles by the deadline it is told `Timeout`, and a permission
    /// answer or open completing after that is discarded.
    pub fn request_permission_and_open_camera_async(
        &self,
        deadline: Deadline,
        name: CameraName,
        continuation: Continuation<dyn StateCallback>,
    ) {
        let gate = Arc::new(OutcomeGate::new(name.clone(), continuation));
        let timer = Arc::clone(&gate);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(deadline.instant().into()).await;
            timer.expire();
        });

        let gated = self.continuation(gate.clone());
        let manager = self.clone();
        let target = name.clone();
        let on_permission: Arc<PermissionCallback> = Arc::new(move |granted: bool| {
            let name = target.clone();
            if !gate.is_pending() {
                debug!("{}: permission answered after the deadline; ignoring", name);
            } else if !granted {
                info!("{}: permission denied", name);
                manager.deliver(&name, Err(OpenFailure::PermissionDenied), &gated);
            } else if deadline.has_expired() {
                gate.expire();
            } else {
                let reopen = manager.inner.config.manager.reopen_window();
                manager.open(name, Some(deadline), gated.clone(), reopen);
            }
        });
        self.request_permission(
            &name,
            deadline,
            Continuation::new(self.general_executor(), on_permission),
        );
    }

    /// Open `name` without asking for permission. A webcam that is not
    /// attached is waited for up to `reopen`.
    pub fn async_open_camera_assuming_permission(
        &self,
        name: CameraName,
        continuation: Continuation<dyn StateCallback>,
        reopen: Duration,
    ) {
        let gate = Arc::new(OutcomeGate::new(name.clone(), continuation));
        self.open(name, None, self.continuation(gate), reopen);
    }

    fn open(
        &self,
        name: CameraName,
        deadline: Option<Deadline>,
        continuation: Continuation<dyn StateCallback>,
        reopen: Duration,
    ) {
        match &name {
            CameraName::Webcam(_) => {
                let window = Deadline::after(reopen);
                self.submit_webcam_open(WebcamOpen {
                    retry_until: deadline.map_or(window, |deadline| deadline.min(window)),
                    name,
                    deadline,
                    continuation,
                    reopen,
                });
            }
            CameraName::Switchable(_) => {
                let manager = self.clone();
                self.inner.general.execute(Box::new(move || {
                    let result = manager.open_switchable(&name, deadline, &continuation, reopen);
                    manager.deliver(&name, result, &continuation);
                }));
            }
            CameraName::Builtin(_) | CameraName::Unknown => {
                self.deliver(&name, Err(OpenFailure::CameraTypeNotSupported), &continuation);
            }
        }
    }

    fn deliver(
        &self,
        name: &CameraName,
        result: OpenResult,
        continuation: &Continuation<dyn StateCallback>,
    ) {
        match result {
            Ok(camera) => {
                info!("{}: opened", name);
                continuation.dispatch(move |callback| callback.on_opened(camera));
            }
            Err(failure) => {
                info!("{}: open failed: {}", name, failure);
                let name = name.clone();
                continuation.dispatch(move |callback| callback.on_open_failed(&name, failure));
            }
        }
    }

    /// Queue one attempt on the serial executor. A device that is not there
    /// yet is retried later by a fresh job, so other opens are not held up
    /// while this one waits.
    fn submit_webcam_open(&self, open: WebcamOpen) {
        let manager = self.clone();
        self.inner.serial.execute(Box::new(move || {
            match manager.attempt_webcam_open(&open) {
                Attempt::Done(result) => manager.deliver(&open.name, result, &open.continuation),
                Attempt::RetryAfter(pause) => {
                    let retry = manager.clone();
                    manager.inner.runtime.spawn(async move {
                        tokio::time::sleep(pause).await;
                        retry.submit_webcam_open(open);
                    });
                }
            }
        }));
    }

    /// Runs on the serial executor.
    #[instrument(skip_all, fields(camera = %open.name))]
    fn attempt_webcam_open(&self, open: &WebcamOpen) -> Attempt {
        let Some(serial) = open.name.serial_number() else {
            return Attempt::Done(Err(OpenFailure::CameraTypeNotSupported));
        };
        if open.deadline.is_some_and(|deadline| deadline.has_expired()) {
            return Attempt::Done(Err(OpenFailure::Timeout));
        }

        let _scan = usb::scan_lock();
        let devices = self.scan_locked();
        match usb::find_unique(&devices, serial) {
            Ok(device) => Attempt::Done(self.create_webcam(
                &open.name,
                serial,
                device.clone(),
                &open.continuation,
                open.reopen,
            )),
            Err(OpenFailure::OpenFailed(OpenFailedReason::DeviceAbsent))
                if !open.retry_until.has_expired() =>
            {
                debug!("not attached yet; retrying");
                Attempt::RetryAfter(
                    self.inner
                        .config
                        .manager
                        .retry_interval()
                        .min(open.retry_until.remaining()),
                )
            }
            Err(failure) => Attempt::Done(Err(failure)),
        }
    }

    /// Called with the scan lock held.
    fn create_webcam(
        &self,
        name: &CameraName,
        serial: &SerialNumber,
        device: UsbDevice,
        continuation: &Continuation<dyn StateCallback>,
        reopen: Duration,
    ) -> OpenResult {
        debug!("opening {} for {}", device.device_name, name);
        let native = self.inner.backend.open(&device)?;
        let camera = RefCountedCamera::webcam(
            name.clone(),
            WebcamBacking::new(device, native, reopen),
            Some(continuation.clone()),
            self.inner.config.capture.buffer_count,
        );

        let watcher: Arc<dyn UsbAttachmentSubscriber> = Arc::new(ReattachWatcher::new(
            &camera,
            serial.clone(),
            Arc::clone(&self.inner.backend),
        ));
        self.inner.monitor.register(Arc::clone(&watcher));
        let monitor = Arc::clone(&self.inner.monitor);
        camera.on_teardown(move || monitor.unregister(&watcher));

        first_handle(camera)
    }

    /// Open every member, then compose them. Runs on the general executor.
    #[instrument(skip_all, fields(camera = %name))]
    fn open_switchable(
        &self,
        name: &CameraName,
        deadline: Option<Deadline>,
        continuation: &Continuation<dyn StateCallback>,
        reopen: Duration,
    ) -> OpenResult {
        let members = name.members();
        let (results, receiver) = flume::bounded(members.len());
        for (index, member) in members.iter().enumerate() {
            let collector = Arc::new(MemberCollector {
                index,
                results: results.clone(),
            });
            self.open(member.clone(), deadline, self.continuation(collector), reopen);
        }
        drop(results);

        let mut opened: Vec<Option<Camera>> = members.iter().map(|_| None).collect();
        for _ in 0..members.len() {
            let received = match deadline {
                Some(deadline) => receiver.recv_deadline(deadline.instant()),
                None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok((index, Ok(camera))) => opened[index] = Some(camera),
                // Members opened so far are closed as `opened` drops
                Ok((_, Err(failure))) => return Err(failure),
                Err(RecvTimeoutError::Timeout) => return Err(OpenFailure::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(OpenFailure::communication("member open abandoned"))
                }
            }
        }

        let members: Vec<Camera> = opened.into_iter().flatten().collect();
        let camera = RefCountedCamera::switchable(
            name.clone(),
            SwitchableBacking::new(members),
            Some(continuation.clone()),
            self.inner.config.capture.buffer_count,
        );
        first_handle(camera)
    }
}

fn first_handle(camera: Arc<RefCountedCamera>) -> OpenResult {
    Camera::new(camera).map_err(|err: CameraError| OpenFailure::communication(err.to_string()))
}

fn record_outcome(failure: Option<&OpenFailure>) {
    let outcome = failure.map_or("opened", OpenFailure::label);
    metrics::counter!("robocam_camera_opens_total", "outcome" => outcome).increment(1);
}

/// One webcam open request, carried across attempts
struct WebcamOpen {
    name: CameraName,
    deadline: Option<Deadline>,
    /// Give up waiting for the device to appear after this
    retry_until: Deadline,
    continuation: Continuation<dyn StateCallback>,
    reopen: Duration,
}

enum Attempt {
    Done(OpenResult),
    RetryAfter(Duration),
}

const PENDING: u8 = 0;
const SETTLED: u8 = 1;
const EXPIRED: u8 = 2;

/// Settles a top-level open exactly once, either with the pipeline's
/// outcome or with `Timeout` when the deadline fires first. The loser is
/// discarded, and a camera that opens too late is closed. The outcome metric
/// is recorded here and nowhere else.
struct OutcomeGate {
    name: CameraName,
    state: AtomicU8,
    downstream: Continuation<dyn StateCallback>,
}

impl OutcomeGate {
    fn new(name: CameraName, downstream: Continuation<dyn StateCallback>) -> Self {
        Self {
            name,
            state: AtomicU8::new(PENDING),
            downstream,
        }
    }

    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    fn settle(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn expire(&self) {
        if !self.settle(EXPIRED) {
            return;
        }
        info!("{}: not opened before the deadline", self.name);
        record_outcome(Some(&OpenFailure::Timeout));
        let name = self.name.clone();
        self.downstream
            .dispatch(move |callback| callback.on_open_failed(&name, OpenFailure::Timeout));
    }
}

impl StateCallback for OutcomeGate {
    fn on_opened(&self, camera: Camera) {
        if !self.settle(SETTLED) {
            debug!("{}: opened after the deadline; closing", self.name);
            drop(camera);
            return;
        }
        record_outcome(None);
        self.downstream.dispatch(move |callback| callback.on_opened(camera));
    }

    fn on_open_failed(&self, name: &CameraName, failure: OpenFailure) {
        if !self.settle(SETTLED) {
            return;
        }
        record_outcome(Some(&failure));
        let name = name.clone();
        self.downstream
            .dispatch(move |callback| callback.on_open_failed(&name, failure));
    }

    // Lifecycle events only concern a camera the caller actually received
    fn on_closed(&self, name: &CameraName) {
        if self.state.load(Ordering::Acquire) == SETTLED {
            let name = name.clone();
            self.downstream.dispatch(move |callback| callback.on_closed(&name));
        }
    }

    fn on_error(&self, name: &CameraName, error: &CameraError) {
        if self.state.load(Ordering::Acquire) == SETTLED {
            let (name, error) = (name.clone(), error.clone());
            self.downstream
                .dispatch(move |callback| callback.on_error(&name, &error));
        }
    }
}

/// Grants only after every member granted; any denial wins immediately.
struct AllGranted {
    remaining: AtomicUsize,
    reported: AtomicBool,
    downstream: Continuation<PermissionCallback>,
}

impl AllGranted {
    fn answer(&self, granted: bool) {
        let report = if granted {
            self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
        } else {
            true
        };
        if report && !self.reported.swap(true, Ordering::AcqRel) {
            self.downstream.dispatch(move |callback| callback(granted));
        }
    }
}

/// Feeds the pipeline's outcome into the synchronous caller's wait, and
/// forwards it to the caller's own continuation only if the wait took it.
struct SyncBridge {
    sync: Arc<ContinuationSynchronizer<Camera>>,
    forward: Option<Continuation<dyn StateCallback>>,
}

impl StateCallback for SyncBridge {
    fn on_opened(&self, camera: Camera) {
        let name = camera.name().clone();
        let forwarded = match &self.forward {
            Some(_) => camera.dup().ok(),
            None => None,
        };
        match self.sync.finish(Some(camera)) {
            Ok(()) => {
                if let (Some(forward), Some(handle)) = (&self.forward, forwarded) {
                    forward.dispatch(move |callback| callback.on_opened(handle));
                }
            }
            Err(late) => {
                // The caller already gave up; dropping closes the handles
                debug!("{}: opened after the deadline; closing", name);
                drop(forwarded);
                drop(late);
            }
        }
    }

    fn on_open_failed(&self, name: &CameraName, failure: OpenFailure) {
        if self.sync.finish(None).is_err() {
            return;
        }
        if let Some(forward) = &self.forward {
            let name = name.clone();
            forward.dispatch(move |callback| callback.on_open_failed(&name, failure));
        }
    }

    fn on_closed(&self, name: &CameraName) {
        if let Some(forward) = &self.forward {
            let name = name.clone();
            forward.dispatch(move |callback| callback.on_closed(&name));
        }
    }

    fn on_error(&self, name: &CameraName, error: &CameraError) {
        if let Some(forward) = &self.forward {
            let (name, error) = (name.clone(), error.clone());
            forward.dispatch(move |callback| callback.on_error(&name, &error));
        }
    }
}

/// Hands the outcome to an async waiter. If the waiter is gone the handle
/// comes back from the failed send and is closed on drop.
struct ChannelCallback {
    results: flume::Sender<OpenResult>,
}

impl StateCallback for ChannelCallback {
    fn on_opened(&self, camera: Camera) {
        let _ = self.results.send(Ok(camera));
    }

    fn on_open_failed(&self, _name: &CameraName, failure: OpenFailure) {
        let _ = self.results.send(Err(failure));
    }
}

/// Collects one member's outcome for a switchable open
struct MemberCollector {
    index: usize,
    results: flume::Sender<(usize, OpenResult)>,
}

impl StateCallback for MemberCollector {
    fn on_opened(&self, camera: Camera) {
        let _ = self.results.send((self.index, Ok(camera)));
    }

    fn on_open_failed(&self, _name: &CameraName, failure: OpenFailure) {
        let _ = self.results.send((self.index, Err(failure)));
    }
}
