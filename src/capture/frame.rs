use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::buffers::PooledBuffer;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
    Rgb24,
    Nv12,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Nv12 => *b"NV12",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }

    /// Bytes per line for uncompressed formats
    pub fn stride_for(&self, width: u32) -> u32 {
        match self {
            PixelFormat::Yuyv => width * 2,
            PixelFormat::Rgb24 => width * 3,
            PixelFormat::Nv12 => width,
            PixelFormat::Mjpeg => 0,
        }
    }

    /// Upper bound on the bytes one frame of this format occupies
    pub fn max_frame_bytes(&self, size: Size) -> usize {
        let pixels = size.width as usize * size.height as usize;
        match self {
            PixelFormat::Yuyv => pixels * 2,
            PixelFormat::Rgb24 | PixelFormat::Mjpeg => pixels * 3,
            PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.fourcc()))
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// What a capture session is asked to stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub format: PixelFormat,
    pub size: Size,
    pub fps: u32,
}

impl CaptureRequest {
    pub fn new(format: PixelFormat, size: Size, fps: u32) -> Self {
        Self { format, size, fps }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

static NEXT_SEQUENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one `start_capturing` call, unique within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureSequenceId(u64);

impl CaptureSequenceId {
    pub fn next() -> Self {
        Self(NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub frame_number: u64,
    pub size: Size,
    pub stride: u32,
    pub format: PixelFormat,
    /// When the frame reached us
    pub capture_time: Instant,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Read-only view shared by every kind of frame a capture callback sees.
pub trait Frame: Send + Sync + fmt::Debug {
    fn request(&self) -> &CaptureRequest;
    fn capture_sequence_id(&self) -> CaptureSequenceId;
    fn frame_number(&self) -> u64;
    fn size(&self) -> Size;
    fn format(&self) -> PixelFormat;
    fn stride(&self) -> u32;
    fn capture_time(&self) -> Instant;
    fn image_buffer(&self) -> &[u8];

    fn image_size(&self) -> usize {
        self.image_buffer().len()
    }

    /// The frame that owns the pixel buffer behind this one
    fn underlying(&self) -> &CameraFrame;

    /// Snapshot that no longer shares storage with the live pipeline
    fn copy_boxed(&self) -> Box<dyn Frame>;
}

enum FrameBuffer {
    /// Lent by the session's pool; goes back when the last reference drops.
    Pooled(PooledBuffer),
    Owned(Bytes),
}

impl FrameBuffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            FrameBuffer::Pooled(buffer) => &buffer[..],
            FrameBuffer::Owned(bytes) => &bytes[..],
        }
    }
}

struct FrameInner {
    request: CaptureRequest,
    sequence_id: CaptureSequenceId,
    meta: FrameMetadata,
    buffer: FrameBuffer,
}

/// A frame produced by a camera. Cloning takes another structural reference
/// on the same buffer; [`CameraFrame::copy`] detaches the content.
#[derive(Clone)]
pub struct CameraFrame {
    inner: Arc<FrameInner>,
}

impl CameraFrame {
    pub(crate) fn pooled(
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        meta: FrameMetadata,
        buffer: PooledBuffer,
    ) -> Self {
        Self::with_buffer(request, sequence_id, meta, FrameBuffer::Pooled(buffer))
    }

    /// A frame over caller-owned bytes, e.g. one produced outside a session
    pub fn from_bytes(
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        meta: FrameMetadata,
        data: Bytes,
    ) -> Self {
        Self::with_buffer(request, sequence_id, meta, FrameBuffer::Owned(data))
    }

    fn with_buffer(
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        meta: FrameMetadata,
        buffer: FrameBuffer,
    ) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                request,
                sequence_id,
                meta,
                buffer,
            }),
        }
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.inner.meta
    }

    /// Number of live structural references on this frame's buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.inner.buffer, FrameBuffer::Pooled(_))
    }

    pub fn copy(&self) -> CameraFrame {
        let inner = &self.inner;
        Self::from_bytes(
            inner.request,
            inner.sequence_id,
            inner.meta.clone(),
            Bytes::copy_from_slice(inner.buffer.as_slice()),
        )
    }
}

impl Frame for CameraFrame {
    fn request(&self) -> &CaptureRequest {
        &self.inner.request
    }

    fn capture_sequence_id(&self) -> CaptureSequenceId {
        self.inner.sequence_id
    }

    fn frame_number(&self) -> u64 {
        self.inner.meta.frame_number
    }

    fn size(&self) -> Size {
        self.inner.meta.size
    }

    fn format(&self) -> PixelFormat {
        self.inner.meta.format
    }

    fn stride(&self) -> u32 {
        self.inner.meta.stride
    }

    fn capture_time(&self) -> Instant {
        self.inner.meta.capture_time
    }

    fn image_buffer(&self) -> &[u8] {
        self.inner.buffer.as_slice()
    }

    fn underlying(&self) -> &CameraFrame {
        self
    }

    fn copy_boxed(&self) -> Box<dyn Frame> {
        Box::new(self.copy())
    }
}

impl fmt::Debug for CameraFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraFrame")
            .field("frame_number", &self.inner.meta.frame_number)
            .field("size", &self.inner.meta.size)
            .field("format", &self.inner.meta.format)
            .field("bytes", &self.inner.buffer.as_slice().len())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_request() -> CaptureRequest {
        CaptureRequest::new(PixelFormat::Yuyv, Size::new(4, 2), 30)
    }

    pub(crate) fn test_frame(frame_number: u64, fill: u8) -> CameraFrame {
        let request = test_request();
        let meta = FrameMetadata {
            frame_number,
            size: request.size,
            stride: request.format.stride_for(request.size.width),
            format: request.format,
            capture_time: Instant::now(),
            device_timestamp: None,
        };
        let data = vec![fill; request.format.max_frame_bytes(request.size)];
        CameraFrame::from_bytes(request, CaptureSequenceId::next(), meta, Bytes::from(data))
    }

    #[test]
    fn test_fourcc_round_trip() {
        for format in [
            PixelFormat::Yuyv,
            PixelFormat::Mjpeg,
            PixelFormat::Rgb24,
            PixelFormat::Nv12,
        ] {
            assert_eq!(PixelFormat::from_fourcc(&format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }

    #[test]
    fn test_clone_shares_copy_detaches() {
        let frame = test_frame(3, 0x5a);
        let shared = frame.clone();
        assert_eq!(frame.ref_count(), 2);

        let snapshot = frame.copy();
        assert_eq!(snapshot.ref_count(), 1);
        assert_eq!(snapshot.frame_number(), 3);
        assert_eq!(snapshot.image_buffer(), frame.image_buffer());
        assert_ne!(
            snapshot.image_buffer().as_ptr(),
            frame.image_buffer().as_ptr()
        );

        drop(shared);
        assert_eq!(frame.ref_count(), 1);
    }

    #[test]
    fn test_sequence_ids_are_unique() {
        let a = CaptureSequenceId::next();
        let b = CaptureSequenceId::next();
        assert!(b > a);
    }
}
