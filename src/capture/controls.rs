//! What a camera can stream, and the exposure and focus controls it exposes

use std::fmt;
use std::time::Duration;

use super::frame::{CaptureRequest, PixelFormat, Size};

/// One streamable combination, with the fastest frame rate the device
/// offers for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraMode {
    pub format: PixelFormat,
    pub size: Size,
    pub max_fps: u32,
}

/// Everything a camera reported it can stream, in the order the driver
/// enumerated it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraCharacteristics {
    modes: Vec<CameraMode>,
}

impl CameraCharacteristics {
    pub fn new(modes: Vec<CameraMode>) -> Self {
        Self { modes }
    }

    pub fn modes(&self) -> &[CameraMode] {
        &self.modes
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn formats(&self) -> Vec<PixelFormat> {
        let mut formats = Vec::new();
        for mode in &self.modes {
            if !formats.contains(&mode.format) {
                formats.push(mode.format);
            }
        }
        formats
    }

    pub fn sizes(&self, format: PixelFormat) -> Vec<Size> {
        let mut sizes = Vec::new();
        for mode in self.modes.iter().filter(|mode| mode.format == format) {
            if !sizes.contains(&mode.size) {
                sizes.push(mode.size);
            }
        }
        sizes
    }

    /// The first size the driver listed for `format`
    pub fn default_size(&self, format: PixelFormat) -> Option<Size> {
        self.modes
            .iter()
            .find(|mode| mode.format == format)
            .map(|mode| mode.size)
    }

    pub fn max_fps(&self, format: PixelFormat, size: Size) -> Option<u32> {
        self.modes
            .iter()
            .filter(|mode| mode.format == format && mode.size == size)
            .map(|mode| mode.max_fps)
            .max()
    }

    pub fn supports(&self, request: &CaptureRequest) -> bool {
        self.max_fps(request.format, request.size)
            .is_some_and(|fps| request.fps <= fps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExposureMode {
    Auto,
    Manual,
    ShutterPriority,
    AperturePriority,
}

impl ExposureMode {
    /// Whether an absolute exposure time may be set in this mode
    pub fn accepts_exposure(self) -> bool {
        matches!(self, Self::Manual | Self::ShutterPriority)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FocusMode {
    Auto,
    /// Focus stays where the focus length puts it
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    ExposureMode,
    Exposure,
    FocusMode,
    FocusLength,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ExposureMode => "exposure mode",
            Self::Exposure => "exposure",
            Self::FocusMode => "focus mode",
            Self::FocusLength => "focus length",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue {
    ExposureMode(ExposureMode),
    Exposure(Duration),
    FocusMode(FocusMode),
    /// Driver units; larger is further away
    FocusLength(i32),
}

impl ControlValue {
    pub fn kind(&self) -> ControlKind {
        match self {
            Self::ExposureMode(_) => ControlKind::ExposureMode,
            Self::Exposure(_) => ControlKind::Exposure,
            Self::FocusMode(_) => ControlKind::FocusMode,
            Self::FocusLength(_) => ControlKind::FocusLength,
        }
    }
}

/// The last value set for each control, so that a device taking over (a
/// newly active member, or a webcam that came back) can be brought to the
/// same settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlCache {
    exposure_mode: Option<ExposureMode>,
    exposure: Option<Duration>,
    focus_mode: Option<FocusMode>,
    focus_length: Option<i32>,
}

impl ControlCache {
    pub fn record(&mut self, value: ControlValue) {
        match value {
            ControlValue::ExposureMode(mode) => self.exposure_mode = Some(mode),
            ControlValue::Exposure(exposure) => self.exposure = Some(exposure),
            ControlValue::FocusMode(mode) => self.focus_mode = Some(mode),
            ControlValue::FocusLength(length) => self.focus_length = Some(length),
        }
    }

    pub fn get(&self, kind: ControlKind) -> Option<ControlValue> {
        match kind {
            ControlKind::ExposureMode => self.exposure_mode.map(ControlValue::ExposureMode),
            ControlKind::Exposure => self.exposure.map(ControlValue::Exposure),
            ControlKind::FocusMode => self.focus_mode.map(ControlValue::FocusMode),
            ControlKind::FocusLength => self.focus_length.map(ControlValue::FocusLength),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Values to apply, modes before the settings that depend on them.
    /// Devices refuse an absolute exposure or focus while the matching
    /// automatic mode is on, so those are left out unless the cached mode
    /// allows them.
    pub fn replay(&self) -> Vec<ControlValue> {
        let mut values = Vec::new();
        if let Some(mode) = self.exposure_mode {
            values.push(ControlValue::ExposureMode(mode));
            if let (true, Some(exposure)) = (mode.accepts_exposure(), self.exposure) {
                values.push(ControlValue::Exposure(exposure));
            }
        }
        if let Some(mode) = self.focus_mode {
            values.push(ControlValue::FocusMode(mode));
            if let (FocusMode::Fixed, Some(length)) = (mode, self.focus_length) {
                values.push(ControlValue::FocusLength(length));
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(format: PixelFormat, width: u32, height: u32, max_fps: u32) -> CameraMode {
        CameraMode {
            format,
            size: Size::new(width, height),
            max_fps,
        }
    }

    #[test]
    fn test_characteristics_queries() {
        let characteristics = CameraCharacteristics::new(vec![
            mode(PixelFormat::Yuyv, 640, 480, 30),
            mode(PixelFormat::Yuyv, 1280, 720, 10),
            mode(PixelFormat::Mjpeg, 1280, 720, 30),
            mode(PixelFormat::Mjpeg, 1280, 720, 60),
        ]);

        assert_eq!(
            characteristics.formats(),
            vec![PixelFormat::Yuyv, PixelFormat::Mjpeg]
        );
        assert_eq!(
            characteristics.sizes(PixelFormat::Yuyv),
            vec![Size::new(640, 480), Size::new(1280, 720)]
        );
        assert_eq!(characteristics.sizes(PixelFormat::Mjpeg).len(), 1);
        assert_eq!(
            characteristics.default_size(PixelFormat::Yuyv),
            Some(Size::new(640, 480))
        );
        assert_eq!(characteristics.default_size(PixelFormat::Nv12), None);
        assert_eq!(
            characteristics.max_fps(PixelFormat::Mjpeg, Size::new(1280, 720)),
            Some(60)
        );

        assert!(characteristics.supports(&CaptureRequest::new(
            PixelFormat::Yuyv,
            Size::new(1280, 720),
            10
        )));
        assert!(!characteristics.supports(&CaptureRequest::new(
            PixelFormat::Yuyv,
            Size::new(1280, 720),
            30
        )));
        assert!(!characteristics.supports(&CaptureRequest::new(
            PixelFormat::Rgb24,
            Size::new(640, 480),
            5
        )));
    }

    #[test]
    fn test_replay_puts_modes_first_and_skips_blocked_settings() {
        let mut cache = ControlCache::default();
        assert!(cache.is_empty());
        assert!(cache.replay().is_empty());

        cache.record(ControlValue::Exposure(Duration::from_millis(8)));
        cache.record(ControlValue::FocusLength(120));
        // No mode known yet, so nothing that depends on one is replayed
        assert!(cache.replay().is_empty());

        cache.record(ControlValue::ExposureMode(ExposureMode::Auto));
        cache.record(ControlValue::FocusMode(FocusMode::Auto));
        assert_eq!(
            cache.replay(),
            vec![
                ControlValue::ExposureMode(ExposureMode::Auto),
                ControlValue::FocusMode(FocusMode::Auto),
            ]
        );

        cache.record(ControlValue::ExposureMode(ExposureMode::Manual));
        cache.record(ControlValue::FocusMode(FocusMode::Fixed));
        assert_eq!(
            cache.replay(),
            vec![
                ControlValue::ExposureMode(ExposureMode::Manual),
                ControlValue::Exposure(Duration::from_millis(8)),
                ControlValue::FocusMode(FocusMode::Fixed),
                ControlValue::FocusLength(120),
            ]
        );
        assert_eq!(
            cache.get(ControlKind::Exposure),
            Some(ControlValue::Exposure(Duration::from_millis(8)))
        );
    }
}
