//! Reopening a webcam that was unplugged and plugged back in

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::name::SerialNumber;
use super::refcount::RefCountedCamera;
use crate::usb::monitor::{ClaimFlag, UsbAttachmentSubscriber};
use crate::usb::{self, CameraBackend, UsbDevice};

/// Watches the bus on behalf of one open webcam. On detach of its device the
/// native resource is released; a matching device that attaches within the
/// reopen window is claimed and streaming resumes.
pub(crate) struct ReattachWatcher {
    camera: Weak<RefCountedCamera>,
    pattern: SerialNumber,
    backend: Arc<dyn CameraBackend>,
}

impl ReattachWatcher {
    pub(crate) fn new(
        camera: &Arc<RefCountedCamera>,
        pattern: SerialNumber,
        backend: Arc<dyn CameraBackend>,
    ) -> Self {
        Self {
            camera: Arc::downgrade(camera),
            pattern,
            backend,
        }
    }

    /// A wildcard identity only reattaches when exactly one device matches it
    fn is_unambiguous(&self, device: &UsbDevice) -> bool {
        if !self.pattern.is_wildcard() {
            return true;
        }
        let devices = match self.backend.attached_devices() {
            Ok(devices) => devices,
            Err(err) => {
                warn!("bus scan failed: {}", err);
                return false;
            }
        };
        match usb::find_unique(&devices, &self.pattern) {
            Ok(unique) => unique.device_name == device.device_name,
            Err(failure) => {
                warn!("not reattaching {}: {}", self.pattern, failure);
                false
            }
        }
    }
}

impl UsbAttachmentSubscriber for ReattachWatcher {
    fn on_attached(&self, device: &UsbDevice, serial: &SerialNumber, claim: &ClaimFlag) {
        let Some(camera) = self.camera.upgrade() else {
            return;
        };
        if !serial.matches(&self.pattern) || !camera.awaiting_reattach() {
            return;
        }

        let _scan = usb::scan_lock();
        if !self.is_unambiguous(device) {
            return;
        }
        if !claim.claim() {
            debug!("{} already claimed by another subscriber", device.device_name);
            return;
        }
        match self.backend.open(device) {
            Ok(native) => {
                camera.reattach(device.clone(), native);
            }
            Err(reason) => warn!(
                "{}: reopening {} failed: {}",
                camera.name(),
                device.device_name,
                reason
            ),
        }
    }

    fn on_detached(&self, device: &UsbDevice) {
        if let Some(camera) = self.camera.upgrade() {
            camera.mark_disconnected(Some(&device.device_name));
        }
    }
}
