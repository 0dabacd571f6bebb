//! Error types for camera acquisition

use std::io;

use thiserror::Error;

use crate::camera::name::{CameraName, SerialNumber};
use crate::capture::ControlKind;

/// Result type alias using [`CameraError`]
pub type Result<T> = std::result::Result<T, CameraError>;

/// Why an attempt to open a camera did not produce a handle.
///
/// These are always delivered by value through a continuation or a return
/// value, never raised across an asynchronous boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenFailure {
    #[error("permission denied")]
    PermissionDenied,

    #[error("open failed: {0}")]
    OpenFailed(OpenFailedReason),

    #[error("deadline expired before the camera opened")]
    Timeout,

    #[error("camera type not supported")]
    CameraTypeNotSupported,

    /// A wildcard identity matched more than one attached device.
    #[error("more than one attached device matches {0}")]
    AmbiguousIdentity(SerialNumber),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenFailedReason {
    #[error("device not attached")]
    DeviceAbsent,

    #[error("communication error: {0}")]
    Communication(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

impl OpenFailure {
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::OpenFailed(OpenFailedReason::Communication(msg.into()))
    }

    /// Short label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::OpenFailed(_) => "open_failed",
            Self::Timeout => "timeout",
            Self::CameraTypeNotSupported => "type_not_supported",
            Self::AmbiguousIdentity(_) => "ambiguous",
        }
    }
}

impl From<OpenFailedReason> for OpenFailure {
    fn from(reason: OpenFailedReason) -> Self {
        Self::OpenFailed(reason)
    }
}

/// Errors from synchronous operations on cameras, sessions and configuration
#[derive(Debug, Error)]
pub enum CameraError {
    /// The handle (or the device behind it) has been closed.
    #[error("device closed")]
    DeviceClosed,

    #[error("device disconnected")]
    Disconnected,

    #[error("stream error: {0}")]
    Stream(String),

    #[error("invalid camera name: {0}")]
    InvalidName(String),

    #[error("{0} is not a member of this camera")]
    NotAMember(CameraName),

    #[error("operation not supported by {0}")]
    Unsupported(CameraName),

    #[error("{0} control not supported")]
    ControlUnsupported(ControlKind),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CameraError {
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}

/// Errors are reported to every interested callback, so they need to be
/// duplicated. Wrapped library errors keep their kind and message.
impl Clone for CameraError {
    fn clone(&self) -> Self {
        match self {
            Self::DeviceClosed => Self::DeviceClosed,
            Self::Disconnected => Self::Disconnected,
            Self::Stream(msg) => Self::Stream(msg.clone()),
            Self::InvalidName(msg) => Self::InvalidName(msg.clone()),
            Self::NotAMember(name) => Self::NotAMember(name.clone()),
            Self::Unsupported(name) => Self::Unsupported(name.clone()),
            Self::ControlUnsupported(kind) => Self::ControlUnsupported(*kind),
            Self::Io(err) => Self::Io(io::Error::new(err.kind(), err.to_string())),
            Self::Config(err) => Self::Config(config::ConfigError::Message(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_failure_display() {
        let err = OpenFailure::OpenFailed(OpenFailedReason::DeviceAbsent);
        assert_eq!(err.to_string(), "open failed: device not attached");
        assert_eq!(err.label(), "open_failed");
    }

    #[test]
    fn test_clone_keeps_io_kind() {
        let err = CameraError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        match err.clone() {
            CameraError::Io(copy) => {
                assert_eq!(copy.kind(), io::ErrorKind::NotFound);
                assert_eq!(copy.to_string(), "gone");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ambiguous_names_serial() {
        let serial: SerialNumber = "VendorProduct:046D|0825|".parse().unwrap();
        let err = OpenFailure::AmbiguousIdentity(serial);
        assert!(err.to_string().contains("VendorProduct:046D|0825"));
    }
}
