#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use robocam::capture::{
    CameraCharacteristics, CameraMode, CaptureRequest, ControlKind, ControlValue, NativeCamera,
    PixelFormat, RawFrameInfo, Size,
};
use robocam::usb::{CameraBackend, UsbDevice};
use robocam::{
    Camera, CameraError, CameraManager, CameraName, CaptureCallback, Config, Frame,
    OpenFailedReason, OpenFailure, PermissionAuthority, SerialNumber, StateCallback,
};

pub const VENDOR: u16 = 0x046d;
pub const PRODUCT: u16 = 0x0825;

pub fn device(node: &str, serial: Option<&str>, path: &str) -> UsbDevice {
    UsbDevice {
        device_name: node.to_string(),
        vendor_id: VENDOR,
        product_id: PRODUCT,
        serial_number: serial.map(str::to_string),
        connection_path: Some(path.to_string()),
    }
}

pub fn webcam(serial: &str) -> CameraName {
    CameraName::webcam(SerialNumber::usb(serial))
}

pub fn small_request() -> CaptureRequest {
    CaptureRequest::new(PixelFormat::Yuyv, Size::new(4, 4), 30)
}

/// Control changes seen by every fake native, tagged with its open ordinal
pub type AppliedControls = Arc<Mutex<Vec<(u8, ControlValue)>>>;

/// Streams a fixed byte pattern until its link goes down. Has exposure
/// controls and a focus mode, but no focus length.
pub struct FakeNative {
    pattern: u8,
    link: Arc<AtomicBool>,
    drops: Arc<AtomicUsize>,
    applied: AppliedControls,
    request: Option<CaptureRequest>,
    sequence: u64,
}

impl NativeCamera for FakeNative {
    fn start_streaming(&mut self, request: &CaptureRequest) -> robocam::Result<CaptureRequest> {
        if !self.link.load(Ordering::SeqCst) {
            return Err(CameraError::Disconnected);
        }
        self.request = Some(*request);
        Ok(*request)
    }

    fn read_frame(&mut self, buffer: &mut Vec<u8>) -> robocam::Result<RawFrameInfo> {
        thread::sleep(Duration::from_millis(2));
        if !self.link.load(Ordering::SeqCst) {
            return Err(CameraError::Disconnected);
        }
        let request = self
            .request
            .ok_or_else(|| CameraError::stream("not streaming"))?;
        let len = request.format.max_frame_bytes(request.size);
        buffer.resize(buffer.len() + len, self.pattern);
        self.sequence += 1;
        Ok(RawFrameInfo {
            sequence: self.sequence,
            bytes_used: len,
            stride: request.format.stride_for(request.size.width),
            device_timestamp: None,
        })
    }

    fn stop_streaming(&mut self) -> robocam::Result<()> {
        self.request = None;
        Ok(())
    }

    fn characteristics(&mut self) -> robocam::Result<CameraCharacteristics> {
        let request = small_request();
        Ok(CameraCharacteristics::new(vec![
            CameraMode {
                format: request.format,
                size: request.size,
                max_fps: 30,
            },
            CameraMode {
                format: PixelFormat::Mjpeg,
                size: Size::new(8, 8),
                max_fps: 60,
            },
        ]))
    }

    fn control(&mut self, kind: ControlKind) -> robocam::Result<ControlValue> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, value)| *pattern == self.pattern && value.kind() == kind)
            .map(|(_, value)| *value)
            .ok_or(CameraError::ControlUnsupported(kind))
    }

    fn set_control(&mut self, value: ControlValue) -> robocam::Result<()> {
        if value.kind() == ControlKind::FocusLength {
            return Err(CameraError::ControlUnsupported(value.kind()));
        }
        self.applied.lock().unwrap().push((self.pattern, value));
        Ok(())
    }
}

impl Drop for FakeNative {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// An in-memory bus. Every open hands out a [`FakeNative`] whose pattern
/// byte is the open's ordinal, starting at 1.
#[derive(Default)]
pub struct FakeBackend {
    devices: Mutex<Vec<UsbDevice>>,
    opens: AtomicUsize,
    drops: Arc<AtomicUsize>,
    links: Mutex<Vec<Arc<AtomicBool>>>,
    fail_open: Mutex<Option<OpenFailedReason>>,
    applied: AppliedControls,
}

impl FakeBackend {
    pub fn with_devices(devices: Vec<UsbDevice>) -> Arc<Self> {
        let backend = Self::default();
        *backend.devices.lock().unwrap() = devices;
        Arc::new(backend)
    }

    pub fn plug(&self, device: UsbDevice) {
        self.devices.lock().unwrap().push(device);
    }

    pub fn unplug(&self, node: &str) -> Option<UsbDevice> {
        let mut devices = self.devices.lock().unwrap();
        let index = devices.iter().position(|d| d.device_name == node)?;
        Some(devices.remove(index))
    }

    /// Make the most recently opened native report a disconnect
    pub fn cut_last_link(&self) {
        if let Some(link) = self.links.lock().unwrap().last() {
            link.store(false, Ordering::SeqCst);
        }
    }

    pub fn fail_opens_with(&self, reason: OpenFailedReason) {
        *self.fail_open.lock().unwrap() = Some(reason);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn natives_dropped(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub fn natives_alive(&self) -> usize {
        self.opens() - self.natives_dropped()
    }

    /// Controls applied to the native from open number `ordinal`, in order
    pub fn controls_applied_to(&self, ordinal: u8) -> Vec<ControlValue> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(pattern, _)| *pattern == ordinal)
            .map(|(_, value)| *value)
            .collect()
    }
}

impl CameraBackend for FakeBackend {
    fn attached_devices(&self) -> std::io::Result<Vec<UsbDevice>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn open(&self, device: &UsbDevice) -> Result<Box<dyn NativeCamera>, OpenFailedReason> {
        if let Some(reason) = self.fail_open.lock().unwrap().clone() {
            return Err(reason);
        }
        if !self
            .devices
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.device_name == device.device_name)
        {
            return Err(OpenFailedReason::DeviceAbsent);
        }
        let ordinal = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Arc::new(AtomicBool::new(true));
        self.links.lock().unwrap().push(Arc::clone(&link));
        Ok(Box::new(FakeNative {
            pattern: ordinal as u8,
            link,
            drops: Arc::clone(&self.drops),
            applied: Arc::clone(&self.applied),
            request: None,
            sequence: 0,
        }))
    }
}

#[derive(Debug)]
pub enum StateEvent {
    Opened(Camera),
    OpenFailed(CameraName, OpenFailure),
    Closed(CameraName),
    Error(CameraName, CameraError),
}

/// Forwards every state notification into a channel
pub struct StateRecorder {
    events: flume::Sender<StateEvent>,
}

impl StateRecorder {
    pub fn new() -> (Arc<Self>, flume::Receiver<StateEvent>) {
        let (events, rx) = flume::unbounded();
        (Arc::new(Self { events }), rx)
    }
}

impl StateCallback for StateRecorder {
    fn on_opened(&self, camera: Camera) {
        let _ = self.events.send(StateEvent::Opened(camera));
    }

    fn on_open_failed(&self, name: &CameraName, failure: OpenFailure) {
        let _ = self
            .events
            .send(StateEvent::OpenFailed(name.clone(), failure));
    }

    fn on_closed(&self, name: &CameraName) {
        let _ = self.events.send(StateEvent::Closed(name.clone()));
    }

    fn on_error(&self, name: &CameraName, error: &CameraError) {
        let _ = self
            .events
            .send(StateEvent::Error(name.clone(), error.clone()));
    }
}

/// Remembers frame numbers and keeps a detached copy of every frame
#[derive(Default)]
pub struct FrameSink {
    numbers: Mutex<Vec<u64>>,
    copies: Mutex<Vec<Box<dyn Frame>>>,
    closed: AtomicBool,
}

impl FrameSink {
    pub fn numbers(&self) -> Vec<u64> {
        self.numbers.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.numbers.lock().unwrap().len()
    }

    pub fn take_copies(&self) -> Vec<Box<dyn Frame>> {
        std::mem::take(&mut *self.copies.lock().unwrap())
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` frames have arrived
    pub fn wait_for(&self, n: usize) -> bool {
        eventually(Duration::from_secs(5), || self.count() >= n)
    }
}

impl CaptureCallback for FrameSink {
    fn on_new_frame(&self, frame: &dyn Frame) {
        self.numbers.lock().unwrap().push(frame.frame_number());
        let mut copies = self.copies.lock().unwrap();
        if copies.len() < 4096 {
            copies.push(frame.copy_boxed());
        }
    }

    fn on_session_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + timeout;
    while Instant::now() < until {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

pub fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.manager.reopen_window_ms = 2_000;
    config.manager.retry_interval_ms = 10;
    config.capture.buffer_count = 4;
    Arc::new(config)
}

/// A manager over a fake bus, with its own runtime
pub struct Harness {
    pub runtime: tokio::runtime::Runtime,
    pub backend: Arc<FakeBackend>,
    pub manager: CameraManager,
}

impl Harness {
    pub fn new(devices: Vec<UsbDevice>, permissions: Arc<dyn PermissionAuthority>) -> Self {
        Self::with_config(devices, permissions, test_config())
    }

    pub fn with_config(
        devices: Vec<UsbDevice>,
        permissions: Arc<dyn PermissionAuthority>,
        config: Arc<Config>,
    ) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let backend = FakeBackend::with_devices(devices);
        let manager = CameraManager::with_config(
            backend.clone(),
            permissions,
            runtime.handle().clone(),
            config,
        )
        .unwrap();
        Self {
            runtime,
            backend,
            manager,
        }
    }
}
