//! USB bus access: device descriptors, identity resolution and the platform backend

pub mod hotplug;
pub mod monitor;
pub mod sysfs;

use std::io;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::camera::name::{CameraDirection, SerialNumber};
use crate::capture::NativeCamera;
use crate::error::{OpenFailedReason, OpenFailure};
use crate::utils::lock;

pub use hotplug::spawn_poller;
pub use monitor::{ClaimFlag, HotplugEvent, UsbAttachmentMonitor, UsbAttachmentSubscriber};
pub use sysfs::SysfsBackend;

static SCAN_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes bus scanning and device creation across the whole process so
/// two opens can never race on the same serial number.
pub(crate) fn scan_lock() -> MutexGuard<'static, ()> {
    lock(&SCAN_LOCK)
}

/// Low-level descriptor of a camera device on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbDevice {
    /// Device node, e.g. `/dev/video0`
    pub device_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Hardware serial number, if the device reports one
    pub serial_number: Option<String>,
    /// Port chain the device is plugged into, e.g. `1-1.2`
    pub connection_path: Option<String>,
}

impl UsbDevice {
    /// Stable identity of this device: the hardware serial if it has a usable
    /// one, otherwise vendor/product qualified by the connection path when
    /// that is known. `None` only for a device with no usable ids at all.
    pub fn real_or_vendor_product_serial_number(&self) -> Option<SerialNumber> {
        if let Some(serial) = self
            .serial_number
            .as_deref()
            .map(str::trim)
            .filter(|serial| !serial.is_empty())
        {
            return Some(SerialNumber::usb(serial));
        }
        if self.vendor_id == 0 && self.product_id == 0 {
            return None;
        }
        Some(SerialNumber::vendor_product(
            self.vendor_id,
            self.product_id,
            self.connection_path.clone(),
        ))
    }
}

/// The single attached device matching `pattern`.
///
/// A wildcard that matches several physically distinct devices is refused
/// rather than guessed.
pub fn find_unique<'a>(
    devices: &'a [UsbDevice],
    pattern: &SerialNumber,
) -> Result<&'a UsbDevice, OpenFailure> {
    let mut matching = devices.iter().filter(|device| {
        device
            .real_or_vendor_product_serial_number()
            .is_some_and(|serial| serial.matches(pattern))
    });
    let first = matching
        .next()
        .ok_or(OpenFailure::OpenFailed(OpenFailedReason::DeviceAbsent))?;
    if matching.next().is_some() {
        return Err(OpenFailure::AmbiguousIdentity(pattern.clone()));
    }
    Ok(first)
}

/// Platform access to cameras: enumeration and opening the native resource.
pub trait CameraBackend: Send + Sync {
    fn attached_devices(&self) -> io::Result<Vec<UsbDevice>>;

    /// Directions of cameras built into the controller itself
    fn builtin_cameras(&self) -> Vec<CameraDirection> {
        Vec::new()
    }

    fn open(&self, device: &UsbDevice) -> Result<Box<dyn NativeCamera>, OpenFailedReason>;
}
