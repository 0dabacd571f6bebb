//! V4L2 webcams through memory-mapped streaming

use std::io;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::controls::{
    CameraCharacteristics, CameraMode, ControlKind, ControlValue, ExposureMode, FocusMode,
};
use super::frame::{CaptureRequest, PixelFormat, Size};
use super::{NativeCamera, RawFrameInfo};
use crate::error::{CameraError, OpenFailedReason, Result};

/// errno for a device node whose hardware went away
const ENODEV: i32 = 19;
/// errno for a control the driver does not have
const EINVAL: i32 = 22;

const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_FOCUS_ABSOLUTE: u32 = 0x009a_090a;
const CID_FOCUS_AUTO: u32 = 0x009a_090c;

/// Absolute exposure is counted in 100 µs steps
const EXPOSURE_STEP_US: u64 = 100;

/// Driver-side buffers queued for memory mapping
const MMAP_BUFFERS: u32 = 4;

/// An opened `/dev/videoN` node
pub struct V4l2Camera {
    device: Device,
    path: String,
    stream: Option<MmapStream<'static>>,
    stride: u32,
}

impl V4l2Camera {
    /// Open `path` and check it can capture video
    pub fn open(path: &str) -> std::result::Result<Self, OpenFailedReason> {
        let device = Device::with_path(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => OpenFailedReason::DeviceAbsent,
            _ => OpenFailedReason::Communication(format!("{}: {}", path, err)),
        })?;

        let caps = device
            .query_caps()
            .map_err(|err| OpenFailedReason::Communication(err.to_string()))?;
        info!("{}: {} ({})", path, caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(OpenFailedReason::TypeMismatch(format!(
                "{} cannot capture video",
                path
            )));
        }

        Ok(Self {
            device,
            path: path.to_string(),
            stream: None,
            stride: 0,
        })
    }

    fn negotiate(&mut self, request: &CaptureRequest) -> io::Result<CaptureRequest> {
        let mut fmt = self.device.format()?;
        fmt.width = request.size.width;
        fmt.height = request.size.height;
        fmt.fourcc = FourCC::new(&request.format.fourcc());
        let fmt = self.device.set_format(&fmt)?;

        let format = PixelFormat::from_fourcc(&fmt.fourcc.repr).unwrap_or_else(|| {
            warn!("{}: driver chose unknown format {}", self.path, fmt.fourcc);
            request.format
        });
        self.stride = fmt.stride;

        let params = self.device.set_params(&Parameters::with_fps(request.fps))?;
        let fps = match params.interval.numerator {
            0 => request.fps,
            numerator => params.interval.denominator / numerator,
        };

        Ok(CaptureRequest::new(format, Size::new(fmt.width, fmt.height), fps))
    }
}

impl V4l2Camera {
    /// Fastest rate offered for one format and size, 0 if the driver won't say
    fn max_fps(&self, fourcc: FourCC, size: Size) -> u32 {
        let intervals = match self.device.enum_frameintervals(fourcc, size.width, size.height) {
            Ok(intervals) => intervals,
            Err(err) => {
                debug!("{}: no frame intervals for {} {}: {}", self.path, fourcc, size, err);
                return 0;
            }
        };
        intervals
            .iter()
            .filter_map(|interval| {
                let shortest = match &interval.interval {
                    FrameIntervalEnum::Discrete(fraction) => fraction,
                    FrameIntervalEnum::Stepwise(stepwise) => &stepwise.min,
                };
                (shortest.numerator > 0).then(|| shortest.denominator / shortest.numerator)
            })
            .max()
            .unwrap_or(0)
    }
}

fn control_id(kind: ControlKind) -> u32 {
    match kind {
        ControlKind::ExposureMode => CID_EXPOSURE_AUTO,
        ControlKind::Exposure => CID_EXPOSURE_ABSOLUTE,
        ControlKind::FocusMode => CID_FOCUS_AUTO,
        ControlKind::FocusLength => CID_FOCUS_ABSOLUTE,
    }
}

fn to_v4l(value: ControlValue) -> Value {
    match value {
        ControlValue::ExposureMode(mode) => Value::Integer(match mode {
            ExposureMode::Auto => 0,
            ExposureMode::Manual => 1,
            ExposureMode::ShutterPriority => 2,
            ExposureMode::AperturePriority => 3,
        }),
        ControlValue::Exposure(exposure) => {
            let steps = exposure.as_micros() / u128::from(EXPOSURE_STEP_US);
            Value::Integer(i64::try_from(steps).unwrap_or(i64::MAX).max(1))
        }
        ControlValue::FocusMode(mode) => Value::Boolean(mode == FocusMode::Auto),
        ControlValue::FocusLength(length) => Value::Integer(i64::from(length)),
    }
}

fn from_v4l(kind: ControlKind, value: &Value) -> Result<ControlValue> {
    let raw = match value {
        Value::Integer(raw) => *raw,
        Value::Boolean(on) => i64::from(*on),
        _ => return Err(CameraError::ControlUnsupported(kind)),
    };
    Ok(match kind {
        ControlKind::ExposureMode => ControlValue::ExposureMode(match raw {
            0 => ExposureMode::Auto,
            1 => ExposureMode::Manual,
            2 => ExposureMode::ShutterPriority,
            _ => ExposureMode::AperturePriority,
        }),
        ControlKind::Exposure => ControlValue::Exposure(Duration::from_micros(
            u64::try_from(raw).unwrap_or(0) * EXPOSURE_STEP_US,
        )),
        ControlKind::FocusMode => ControlValue::FocusMode(if raw != 0 {
            FocusMode::Auto
        } else {
            FocusMode::Fixed
        }),
        ControlKind::FocusLength => {
            ControlValue::FocusLength(i32::try_from(raw).unwrap_or(i32::MAX))
        }
    })
}

fn control_error(kind: ControlKind, err: io::Error) -> CameraError {
    if err.raw_os_error() == Some(EINVAL) {
        CameraError::ControlUnsupported(kind)
    } else {
        stream_error(err)
    }
}

fn stream_error(err: io::Error) -> CameraError {
    if err.raw_os_error() == Some(ENODEV) {
        CameraError::Disconnected
    } else {
        CameraError::Io(err)
    }
}

impl NativeCamera for V4l2Camera {
    #[instrument(skip_all, fields(device = %self.path))]
    fn start_streaming(&mut self, request: &CaptureRequest) -> Result<CaptureRequest> {
        self.stream = None;
        let accepted = self.negotiate(request).map_err(stream_error)?;
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, MMAP_BUFFERS)
            .map_err(stream_error)?;
        self.stream = Some(stream);
        info!(
            "streaming {} {} at {} fps",
            accepted.size, accepted.format, accepted.fps
        );
        Ok(accepted)
    }

    fn read_frame(&mut self, buffer: &mut Vec<u8>) -> Result<RawFrameInfo> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::stream("not streaming"))?;
        let (data, meta) = stream.next().map_err(stream_error)?;

        let used = match meta.bytesused as usize {
            0 => data.len(),
            n => n.min(data.len()),
        };
        buffer.extend_from_slice(&data[..used]);

        Ok(RawFrameInfo {
            sequence: u64::from(meta.sequence),
            bytes_used: used,
            stride: self.stride,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec.max(0) as u64)
                    + Duration::from_micros(meta.timestamp.usec.max(0) as u64),
            ),
        })
    }

    fn stop_streaming(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!("{}: stream stopped", self.path);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(device = %self.path))]
    fn characteristics(&mut self) -> Result<CameraCharacteristics> {
        let mut modes = Vec::new();
        for description in self.device.enum_formats().map_err(stream_error)? {
            let Some(format) = PixelFormat::from_fourcc(&description.fourcc.repr) else {
                debug!("skipping unsupported format {}", description.fourcc);
                continue;
            };
            let framesizes = self
                .device
                .enum_framesizes(description.fourcc)
                .map_err(stream_error)?;
            for framesize in framesizes {
                let sizes = match framesize.size {
                    FrameSizeEnum::Discrete(size) => vec![Size::new(size.width, size.height)],
                    // A continuous range is described by its two ends
                    FrameSizeEnum::Stepwise(range) => vec![
                        Size::new(range.min_width, range.min_height),
                        Size::new(range.max_width, range.max_height),
                    ],
                };
                for size in sizes {
                    modes.push(CameraMode {
                        format,
                        size,
                        max_fps: self.max_fps(description.fourcc, size),
                    });
                }
            }
        }
        Ok(CameraCharacteristics::new(modes))
    }

    fn control(&mut self, kind: ControlKind) -> Result<ControlValue> {
        let control = self
            .device
            .control(control_id(kind))
            .map_err(|err| control_error(kind, err))?;
        from_v4l(kind, &control.value)
    }

    fn set_control(&mut self, value: ControlValue) -> Result<()> {
        let kind = value.kind();
        debug!("{}: setting {:?}", self.path, value);
        self.device
            .set_control(Control {
                id: control_id(kind),
                value: to_v4l(value),
            })
            .map_err(|err| control_error(kind, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_values_convert_both_ways() {
        let values = [
            ControlValue::ExposureMode(ExposureMode::Manual),
            ControlValue::ExposureMode(ExposureMode::AperturePriority),
            ControlValue::Exposure(Duration::from_millis(20)),
            ControlValue::FocusMode(FocusMode::Auto),
            ControlValue::FocusMode(FocusMode::Fixed),
            ControlValue::FocusLength(250),
        ];
        for value in values {
            assert_eq!(from_v4l(value.kind(), &to_v4l(value)).unwrap(), value);
        }
    }

    #[test]
    fn test_exposure_rounds_to_device_steps() {
        assert!(matches!(
            to_v4l(ControlValue::Exposure(Duration::from_micros(250))),
            Value::Integer(2)
        ));
        // Never asks the driver for a zero exposure
        assert!(matches!(
            to_v4l(ControlValue::Exposure(Duration::ZERO)),
            Value::Integer(1)
        ));
    }
}
