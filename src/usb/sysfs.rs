//! Linux camera backend reading USB capture nodes from sysfs

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::{CameraBackend, UsbDevice};
use crate::capture::NativeCamera;
use crate::error::OpenFailedReason;
use crate::utils::{read_attr, read_hex_attr};

/// Enumerates `/sys/class/video4linux` and resolves each capture node to the
/// USB device that owns it.
#[derive(Debug, Clone)]
pub struct SysfsBackend {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsBackend {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: PathBuf::from("/dev"),
        }
    }

    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    fn read_node(&self, node: &Path, node_name: &str) -> io::Result<Option<UsbDevice>> {
        // Only the first node of a device streams video; the rest carry metadata
        if read_attr(node, "index")?.is_some_and(|index| index != "0") {
            return Ok(None);
        }
        let interface = match fs::canonicalize(node.join("device")) {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let Some(usb_dir) = interface.parent() else {
            return Ok(None);
        };
        let (Some(vendor_id), Some(product_id)) = (
            read_hex_attr(usb_dir, "idVendor")?,
            read_hex_attr(usb_dir, "idProduct")?,
        ) else {
            debug!("{} is not a USB camera", node_name);
            return Ok(None);
        };

        Ok(Some(UsbDevice {
            device_name: self.dev_root.join(node_name).to_string_lossy().into_owned(),
            vendor_id,
            product_id,
            serial_number: read_attr(usb_dir, "serial")?,
            connection_path: usb_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }))
    }
}

impl CameraBackend for SysfsBackend {
    #[instrument(skip(self))]
    fn attached_devices(&self) -> io::Result<Vec<UsbDevice>> {
        let class_dir = self.sysfs_root.join("class/video4linux");
        let entries = match fs::read_dir(&class_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut devices = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry in {}: {}", class_dir.display(), err);
                    continue;
                }
            };
            let node_name = entry.file_name().to_string_lossy().into_owned();
            if !node_name.starts_with("video") {
                continue;
            }
            // One bad node must not hide every other camera
            match self.read_node(&entry.path(), &node_name) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(err) => warn!("skipping {}: {}", node_name, err),
            }
        }
        devices.sort_by(|a, b| a.device_name.cmp(&b.device_name));
        Ok(devices)
    }

    fn open(&self, device: &UsbDevice) -> Result<Box<dyn NativeCamera>, OpenFailedReason> {
        info!("opening {}", device.device_name);
        open_native(device)
    }
}

#[cfg(feature = "v4l2")]
fn open_native(device: &UsbDevice) -> Result<Box<dyn NativeCamera>, OpenFailedReason> {
    let camera = crate::capture::V4l2Camera::open(&device.device_name)?;
    Ok(Box::new(camera))
}

#[cfg(not(feature = "v4l2"))]
fn open_native(device: &UsbDevice) -> Result<Box<dyn NativeCamera>, OpenFailedReason> {
    Err(OpenFailedReason::Communication(format!(
        "cannot stream {}: built without the v4l2 feature",
        device.device_name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn usb_camera(root: &Path, node: &str, port: &str, serial: Option<&str>) {
        let usb_dir = root.join("devices/usb1").join(port);
        let interface = usb_dir.join(format!("{port}:1.0"));
        fs::create_dir_all(&interface).unwrap();
        fs::write(usb_dir.join("idVendor"), "046d\n").unwrap();
        fs::write(usb_dir.join("idProduct"), "0825\n").unwrap();
        if let Some(serial) = serial {
            fs::write(usb_dir.join("serial"), format!("{serial}\n")).unwrap();
        }

        let node_dir = root.join("class/video4linux").join(node);
        fs::create_dir_all(&node_dir).unwrap();
        fs::write(node_dir.join("index"), "0\n").unwrap();
        symlink(&interface, node_dir.join("device")).unwrap();
    }

    #[test]
    fn test_enumerates_usb_capture_nodes() {
        let root = std::env::temp_dir().join(format!("robocam-sysfs-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        usb_camera(&root, "video0", "1-1", Some("ABC123"));
        usb_camera(&root, "video2", "1-2", None);

        // Metadata node of the first camera
        let meta = root.join("class/video4linux/video1");
        fs::create_dir_all(&meta).unwrap();
        fs::write(meta.join("index"), "1\n").unwrap();

        let backend = SysfsBackend::new(&root);
        let devices = backend.attached_devices().unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_name, "/dev/video0");
        assert_eq!(devices[0].serial_number.as_deref(), Some("ABC123"));
        assert_eq!(devices[0].connection_path.as_deref(), Some("1-1"));
        assert_eq!(devices[1].vendor_id, 0x046d);
        assert_eq!(devices[1].product_id, 0x0825);
        assert_eq!(devices[1].serial_number, None);
        assert_eq!(devices[1].connection_path.as_deref(), Some("1-2"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_unreadable_node_is_skipped() {
        let root = std::env::temp_dir().join(format!("robocam-sysfs-bad-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        usb_camera(&root, "video0", "1-1", Some("GOOD"));
        usb_camera(&root, "video2", "1-2", None);
        // Reading a directory as an attribute fails with something other than NotFound
        fs::create_dir_all(root.join("devices/usb1/1-2/serial")).unwrap();

        let devices = SysfsBackend::new(&root).attached_devices().unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_name, "/dev/video0");
        assert_eq!(devices[0].serial_number.as_deref(), Some("GOOD"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_missing_class_dir_is_empty() {
        let backend = SysfsBackend::new("/nonexistent/robocam");
        assert!(backend.attached_devices().unwrap().is_empty());
    }
}
