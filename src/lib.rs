pub mod camera;
pub mod capture;
pub mod continuation;
pub mod deadline;
pub mod error;
pub mod manager;
pub mod permission;
pub mod usb;
mod utils;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::{PixelFormat, Size};
use serde::{Deserialize, Serialize};

pub use camera::{Camera, CameraDirection, CameraName, SerialNumber, StateCallback};
pub use capture::{
    CameraCharacteristics, CaptureCallback, CaptureRequest, CaptureSession, ControlKind,
    ControlValue, ExposureMode, FocusMode, Frame,
};
pub use continuation::{Continuation, Executor, SerialExecutor};
pub use deadline::Deadline;
pub use error::{CameraError, OpenFailedReason, OpenFailure, Result};
pub use manager::CameraManager;
pub use permission::{AllowList, GrantAll, PendingPermissions, PermissionAuthority};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub capture: CaptureConfig,
    pub usb: UsbConfig,
    pub permissions: PermissionsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Budget for a whole permission-then-open request
    pub open_timeout_ms: u64,
    /// How long a webcam that is briefly absent is waited for
    pub reopen_window_ms: u64,
    pub retry_interval_ms: u64,
    pub serial_executor_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frame buffers per capture; frames beyond this are dropped
    pub buffer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    pub sysfs_root: PathBuf,
    pub hotplug_poll_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Webcams allowed to open. Unset grants everything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<SerialNumber>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 10_000,
            reopen_window_ms: 5_000,
            retry_interval_ms: 100,
            serial_executor_name: "camera-open".into(),
        }
    }
}

impl ManagerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn reopen_window(&self) -> Duration {
        Duration::from_millis(self.reopen_window_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Yuyv,
            width: 640,
            height: 480,
            fps: 30,
            buffer_count: 4,
        }
    }
}

impl CaptureConfig {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            hotplug_poll_ms: 500,
        }
    }
}

impl UsbConfig {
    pub fn hotplug_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_ms.max(10))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "robocam=info".into(),
        }
    }
}

impl PermissionsConfig {
    pub fn authority(&self) -> Arc<dyn PermissionAuthority> {
        match &self.allowed {
            Some(allowed) => Arc::new(AllowList::new(allowed.clone())),
            None => Arc::new(GrantAll),
        }
    }
}

impl Config {
    /// Defaults, overridden by `path` (TOML) if given, then by `ROBOCAM__*`
    /// environment variables such as `ROBOCAM__MANAGER__OPEN_TIMEOUT_MS`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ROBOCAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_layers_file_over_defaults() {
        let path = std::env::temp_dir().join(format!("robocam-config-{}.toml", std::process::id()));
        fs::write(
            &path,
            r#"
[manager]
open_timeout_ms = 250

[capture]
format = "Mjpeg"
buffer_count = 8

[permissions]
allowed = ["ABC", "VendorProduct:046D|0825"]
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.manager.open_timeout(), Duration::from_millis(250));
        assert_eq!(config.manager.reopen_window_ms, 5_000);
        assert_eq!(config.capture.format, PixelFormat::Mjpeg);
        assert_eq!(config.capture.buffer_count, 8);
        assert_eq!(config.capture.size(), Size::new(640, 480));
        assert_eq!(
            config.permissions.allowed,
            Some(vec![
                SerialNumber::usb("ABC"),
                SerialNumber::vendor_product(0x046d, 0x0825, None),
            ])
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/robocam.toml");
        assert!(matches!(
            Config::load(Some(missing)),
            Err(CameraError::Config(_))
        ));
    }

    #[test]
    fn test_global_config_swaps() {
        let mut config = Config::default();
        config.usb.hotplug_poll_ms = 1;
        let previous = CONFIG.swap(Arc::new(config));
        assert_eq!(
            CONFIG.load().usb.hotplug_poll_interval(),
            Duration::from_millis(10)
        );
        CONFIG.store(previous);
    }
}
