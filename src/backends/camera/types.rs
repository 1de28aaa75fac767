// SPDX-License-Identifier: GPL-3.0-only
// Shared types for camera backend abstraction

//! Shared types for camera backends

use crate::errors::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

/// Camera backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CameraBackendType {
    /// libcamera backend via native libcamera-rs bindings
    #[default]
    Libcamera,
    /// In-process simulated camera (no hardware required)
    Virtual,
}

impl std::fmt::Display for CameraBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraBackendType::Libcamera => write!(f, "libcamera"),
            CameraBackendType::Virtual => write!(f, "virtual"),
        }
    }
}

impl std::str::FromStr for CameraBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "libcamera" => Ok(CameraBackendType::Libcamera),
            "virtual" => Ok(CameraBackendType::Virtual),
            other => Err(format!("unknown backend '{}' (expected libcamera or virtual)", other)),
        }
    }
}

/// Capture intent used to pick a default hardware configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StreamRole {
    /// Full resolution still image (default)
    #[default]
    StillCapture,
    /// Live preview
    ViewFinder,
    /// Video recording stream
    VideoRecording,
    /// Unprocessed sensor data
    Raw,
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamRole::StillCapture => write!(f, "still"),
            StreamRole::ViewFinder => write!(f, "viewfinder"),
            StreamRole::VideoRecording => write!(f, "video"),
            StreamRole::Raw => write!(f, "raw"),
        }
    }
}

impl std::str::FromStr for StreamRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "still" | "stillcapture" | "still-capture" => Ok(StreamRole::StillCapture),
            "viewfinder" | "preview" => Ok(StreamRole::ViewFinder),
            "video" | "videorecording" => Ok(StreamRole::VideoRecording),
            "raw" => Ok(StreamRole::Raw),
            other => Err(format!("unknown stream role '{}'", other)),
        }
    }
}

/// Pixel layout of a capture stream
///
/// Packed RGB names describe memory byte order:
/// `RGB888` is R,G,B in memory and `BGR888` is B,G,R in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// I420 / YUV420 - Planar 4:2:0 (Y plane, U plane, V plane)
    I420,
    /// NV12 - Semi-planar 4:2:0 (Y plane + interleaved UV plane)
    NV12,
    /// NV21 - Semi-planar 4:2:0 (Y plane + interleaved VU plane)
    NV21,
    /// YUYV - Packed 4:2:2 (Y0 U Y1 V interleaved)
    YUYV,
    /// RGB888 - 24-bit, R G B byte order
    RGB888,
    /// BGR888 - 24-bit, B G R byte order
    BGR888,
    /// Motion JPEG - one compressed JPEG per buffer
    MJPEG,
}

impl PixelFormat {
    /// Every supported format
    pub const ALL: [PixelFormat; 7] = [
        PixelFormat::I420,
        PixelFormat::NV12,
        PixelFormat::NV21,
        PixelFormat::YUYV,
        PixelFormat::RGB888,
        PixelFormat::BGR888,
        PixelFormat::MJPEG,
    ];

    /// FourCC code as used by V4L2
    pub fn fourcc(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "YU12",
            PixelFormat::NV12 => "NV12",
            PixelFormat::NV21 => "NV21",
            PixelFormat::YUYV => "YUYV",
            PixelFormat::RGB888 => "RGB3",
            PixelFormat::BGR888 => "BGR3",
            PixelFormat::MJPEG => "MJPG",
        }
    }

    /// Parse a FourCC or common format name
    pub fn from_fourcc(code: &str) -> Option<Self> {
        match code.trim() {
            "YU12" | "I420" | "YUV420" => Some(PixelFormat::I420),
            "NV12" => Some(PixelFormat::NV12),
            "NV21" => Some(PixelFormat::NV21),
            "YUYV" | "YUY2" => Some(PixelFormat::YUYV),
            "RGB3" | "RGB24" => Some(PixelFormat::RGB888),
            "BGR3" | "BGR24" => Some(PixelFormat::BGR888),
            "MJPG" | "MJPEG" | "JPEG" => Some(PixelFormat::MJPEG),
            _ => None,
        }
    }

    /// Whether the buffer holds a compressed bitstream instead of raw pixels
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::MJPEG)
    }

    /// Number of memory planes in the standard layout
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::I420 => 3,
            PixelFormat::NV12 | PixelFormat::NV21 => 2,
            _ => 1,
        }
    }

    /// Smallest valid stride (bytes per row of the first plane)
    ///
    /// Odd widths round up to whole chroma pairs: an NV12 row shares its
    /// stride with the interleaved UV row, a YUYV row is made of 4-byte
    /// macropixels.
    pub fn min_stride(&self, width: u32) -> u32 {
        match self {
            PixelFormat::I420 => width,
            PixelFormat::NV12 | PixelFormat::NV21 => width.div_ceil(2) * 2,
            PixelFormat::YUYV => width.div_ceil(2) * 4,
            PixelFormat::RGB888 | PixelFormat::BGR888 => width * 3,
            PixelFormat::MJPEG => 0,
        }
    }

    /// Bytes needed for one frame with the given first-plane stride
    ///
    /// Chroma planes of 4:2:0 formats use half the luma stride (rounded up).
    /// For MJPEG this is the buffer budget, the actual payload is reported
    /// per frame in [`FrameMetadata::bytes_used`].
    pub fn frame_size(&self, width: u32, height: u32, stride: u32) -> usize {
        let stride = stride.max(self.min_stride(width)) as usize;
        let height = height as usize;
        let chroma_rows = height.div_ceil(2);
        match self {
            PixelFormat::I420 => stride * height + 2 * stride.div_ceil(2) * chroma_rows,
            PixelFormat::NV12 | PixelFormat::NV21 => stride * height + stride * chroma_rows,
            PixelFormat::YUYV | PixelFormat::RGB888 | PixelFormat::BGR888 => stride * height,
            PixelFormat::MJPEG => width as usize * height * 2,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelFormat::I420 => "YUV420",
            PixelFormat::NV12 => "NV12",
            PixelFormat::NV21 => "NV21",
            PixelFormat::YUYV => "YUYV",
            PixelFormat::RGB888 => "RGB888",
            PixelFormat::BGR888 => "BGR888",
            PixelFormat::MJPEG => "MJPEG",
        };
        write!(f, "{}", name)
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parses `WIDTHxHEIGHT`, e.g. `1920x1080`
impl std::str::FromStr for Size {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("invalid size '{}' (expected WIDTHxHEIGHT)", s))?;
        let parse = |value: &str| {
            value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| format!("invalid size '{}' (expected WIDTHxHEIGHT)", s))
        };
        Ok(Size::new(parse(width)?, parse(height)?))
    }
}

/// Stream configuration as exchanged with the driver
///
/// Freely editable until it is applied; the driver may rewrite any field
/// during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfiguration {
    pub role: StreamRole,
    pub pixel_format: PixelFormat,
    pub size: Size,
    /// Bytes per row of the first plane (0 lets the driver choose)
    pub stride: u32,
    /// Bytes per frame (0 lets the driver choose)
    pub frame_size: u32,
    pub buffer_count: u32,
}

impl std::fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.size, self.pixel_format)
    }
}

/// Result of asking the driver to sanity-check a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationStatus {
    /// Accepted unchanged
    Valid,
    /// Accepted after the driver rewrote some fields
    Adjusted,
    /// Driver flagged the configuration
    Invalid,
}

/// Negotiated format of the capture stream
///
/// Produced once the configuration is applied and never modified afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    stride: u32,
    frame_size: usize,
}

impl StreamFormat {
    /// Build a format; a stride below the format minimum is raised to it
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32, stride: u32) -> Self {
        let stride = stride.max(pixel_format.min_stride(width));
        Self {
            pixel_format,
            width,
            height,
            stride,
            frame_size: pixel_format.frame_size(width, height, stride),
        }
    }

    pub fn from_configuration(config: &StreamConfiguration) -> Self {
        Self::new(
            config.pixel_format,
            config.size.width,
            config.size.height,
            config.stride,
        )
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Minimum bytes a buffer must hold for one frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// `(offset, length)` of every plane when packed back to back
    pub fn plane_layout(&self) -> Vec<(usize, usize)> {
        let stride = self.stride as usize;
        let luma = stride * self.height as usize;
        let chroma_rows = (self.height as usize).div_ceil(2);
        match self.pixel_format {
            PixelFormat::I420 => {
                let chroma = stride.div_ceil(2) * chroma_rows;
                vec![(0, luma), (luma, chroma), (luma + chroma, chroma)]
            }
            PixelFormat::NV12 | PixelFormat::NV21 => vec![(0, luma), (luma, stride * chroma_rows)],
            _ => vec![(0, self.frame_size)],
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}-{} (stride {})",
            self.width, self.height, self.pixel_format, self.stride
        )
    }
}

/// One contiguous memory region of a frame buffer
///
/// Planes living in the same dmabuf share the same `Arc<OwnedFd>`.
#[derive(Debug, Clone)]
pub struct Plane {
    fd: Arc<OwnedFd>,
    offset: usize,
    length: usize,
}

impl Plane {
    pub fn new(fd: Arc<OwnedFd>, offset: usize, length: usize) -> Self {
        Self { fd, offset, length }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True when both planes are backed by the same memory object
    pub fn shares_memory_with(&self, other: &Plane) -> bool {
        Arc::ptr_eq(&self.fd, &other.fd)
    }
}

/// Hardware-backed memory for one frame
#[derive(Debug)]
pub struct FrameBuffer {
    index: usize,
    allocation: u64,
    planes: Vec<Plane>,
}

impl FrameBuffer {
    /// `allocation` identifies the driver allocation this buffer came from
    pub fn new(index: usize, allocation: u64, planes: Vec<Plane>) -> Self {
        Self {
            index,
            allocation,
            planes,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn allocation(&self) -> u64 {
        self.allocation
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Total bytes over all planes
    pub fn len(&self) -> usize {
        self.planes.iter().map(Plane::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous region starting at the primary plane
    ///
    /// Extends over following planes that live in the same memory object
    /// directly after it, so a multi-planar frame in one dmabuf is mapped
    /// once. Returns `None` when the buffer has no planes.
    pub fn primary_span(&self) -> Option<Plane> {
        let (first, rest) = self.planes.split_first()?;
        let mut end = first.offset + first.length;
        for plane in rest {
            if !plane.shares_memory_with(first) || plane.offset < end {
                break;
            }
            end = plane.offset + plane.length;
        }
        Some(Plane::new(
            Arc::clone(&first.fd),
            first.offset,
            end - first.offset,
        ))
    }
}

/// Per-frame metadata written by the driver on completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number
    pub sequence: u32,
    /// Sensor timestamp relative to stream start
    pub timestamp: Duration,
    /// Bytes actually written, per plane
    pub bytes_used: Vec<usize>,
}

impl FrameMetadata {
    /// Payload of the first plane, if the driver reported one
    pub fn primary_bytes_used(&self) -> Option<usize> {
        self.bytes_used.first().copied()
    }
}

/// Lifecycle of a capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Created by the device, not yet submitted
    Created,
    /// Owned by the device, waiting for a frame
    Queued,
    /// Frame written into the buffer
    Completed,
    /// Dropped by the driver (e.g. device stopped); terminal
    Cancelled,
    /// Completed and marked for resubmission with the same buffer
    Reused,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestStatus::Created => "created",
            RequestStatus::Queued => "queued",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Reused => "reused",
        };
        write!(f, "{}", name)
    }
}

/// "Capture into this buffer": pairs one frame buffer with a device submission
///
/// Requests are created by a [`CameraDevice`](super::CameraDevice) and move by
/// value: into the device when queued, back to the completion callback when
/// done. Whoever holds the request is the only one touching its buffer.
#[derive(Debug)]
pub struct Request {
    cookie: u64,
    status: RequestStatus,
    buffer: Option<Arc<FrameBuffer>>,
    metadata: Option<FrameMetadata>,
}

impl Request {
    pub(crate) fn new(cookie: u64) -> Self {
        Self {
            cookie,
            status: RequestStatus::Created,
            buffer: None,
            metadata: None,
        }
    }

    /// Application-chosen identifier (the buffer index for this crate)
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == RequestStatus::Cancelled
    }

    pub fn buffer(&self) -> Option<&Arc<FrameBuffer>> {
        self.buffer.as_ref()
    }

    /// Metadata of the last completion
    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.metadata.as_ref()
    }

    /// Mark a completed request for resubmission with the same buffer
    ///
    /// Cancelled requests are terminal and cannot be reused.
    pub fn reuse(&mut self) -> CaptureResult<()> {
        match self.status {
            RequestStatus::Completed => {
                self.status = RequestStatus::Reused;
                self.metadata = None;
                Ok(())
            }
            status => Err(CaptureError::InvalidState(format!(
                "request {} cannot be reused while {}",
                self.cookie, status
            ))),
        }
    }

    pub(crate) fn add_buffer(&mut self, buffer: Arc<FrameBuffer>) -> CaptureResult<()> {
        if self.status != RequestStatus::Created {
            return Err(CaptureError::BufferBindingFailed(format!(
                "request {} is {}",
                self.cookie, self.status
            )));
        }
        if self.buffer.is_some() {
            return Err(CaptureError::BufferBindingFailed(format!(
                "request {} already has a buffer",
                self.cookie
            )));
        }
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Whether the request may be handed to the device
    pub(crate) fn is_queueable(&self) -> bool {
        self.buffer.is_some()
            && matches!(self.status, RequestStatus::Created | RequestStatus::Reused)
    }

    pub(crate) fn mark_queued(&mut self) {
        self.status = RequestStatus::Queued;
        self.metadata = None;
    }

    pub(crate) fn complete(&mut self, metadata: FrameMetadata) {
        self.status = RequestStatus::Completed;
        self.metadata = Some(metadata);
    }

    pub(crate) fn cancel(&mut self) {
        self.status = RequestStatus::Cancelled;
        self.metadata = None;
    }
}

/// Callback invoked by a device's event thread for every finished request
pub type CompletionCallback = Box<dyn FnMut(Request) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn test_fd() -> Arc<OwnedFd> {
        let file = File::open("/dev/null").unwrap();
        Arc::new(OwnedFd::from(file))
    }

    #[test]
    fn test_size_from_str() {
        assert_eq!("2304x1296".parse::<Size>(), Ok(Size::new(2304, 1296)));
        assert_eq!(" 640X480 ".parse::<Size>(), Ok(Size::new(640, 480)));
        assert!("640".parse::<Size>().is_err());
        assert!("0x480".parse::<Size>().is_err());
    }

    #[test]
    fn test_i420_frame_size() {
        // 4x4 luma, 2x2 U, 2x2 V
        assert_eq!(PixelFormat::I420.frame_size(4, 4, 4), 16 + 4 + 4);
        // Odd height rounds chroma rows up
        assert_eq!(PixelFormat::I420.frame_size(4, 3, 4), 12 + 2 * 2 * 2);
    }

    #[test]
    fn test_stream_format_raises_short_stride() {
        let format = StreamFormat::new(PixelFormat::YUYV, 640, 480, 100);
        assert_eq!(format.stride(), 1280);
        assert_eq!(format.frame_size(), 1280 * 480);
    }

    #[test]
    fn test_odd_width_strides_hold_whole_chroma_pairs() {
        assert_eq!(PixelFormat::NV12.min_stride(33), 34);
        assert_eq!(PixelFormat::NV21.min_stride(33), 34);
        assert_eq!(PixelFormat::YUYV.min_stride(33), 68);
        assert_eq!(PixelFormat::I420.min_stride(33), 33);

        let format = StreamFormat::new(PixelFormat::NV12, 33, 17, 0);
        assert_eq!(format.frame_size(), 34 * 17 + 34 * 9);
        assert_eq!(format.plane_layout(), vec![(0, 34 * 17), (34 * 17, 34 * 9)]);
    }

    #[test]
    fn test_plane_layout_covers_frame() {
        for format in PixelFormat::ALL {
            let stream = StreamFormat::new(format, 64, 47, 0);
            let layout = stream.plane_layout();
            assert_eq!(layout.len(), format.plane_count());
            let (offset, len) = layout[layout.len() - 1];
            assert_eq!(offset + len, stream.frame_size());
        }
    }

    #[test]
    fn test_fourcc_round_trip() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
    }

    #[test]
    fn test_primary_span_merges_planes_on_same_memory() {
        let fd = test_fd();
        let buffer = FrameBuffer::new(
            0,
            1,
            vec![
                Plane::new(Arc::clone(&fd), 0, 16),
                Plane::new(Arc::clone(&fd), 16, 4),
                Plane::new(Arc::clone(&fd), 20, 4),
            ],
        );
        let span = buffer.primary_span().unwrap();
        assert_eq!(span.offset(), 0);
        assert_eq!(span.len(), 24);
    }

    #[test]
    fn test_primary_span_stops_at_foreign_memory() {
        let buffer = FrameBuffer::new(
            0,
            1,
            vec![Plane::new(test_fd(), 0, 16), Plane::new(test_fd(), 16, 8)],
        );
        assert_eq!(buffer.primary_span().unwrap().len(), 16);
        assert!(FrameBuffer::new(1, 1, Vec::new()).primary_span().is_none());
    }

    #[test]
    fn test_cancelled_request_cannot_be_reused() {
        let mut request = Request::new(3);
        request
            .add_buffer(Arc::new(FrameBuffer::new(3, 1, Vec::new())))
            .unwrap();
        request.mark_queued();
        request.cancel();
        assert!(request.reuse().is_err());
        assert_eq!(request.status(), RequestStatus::Cancelled);
    }

    #[test]
    fn test_completed_request_reuse_keeps_buffer() {
        let mut request = Request::new(0);
        request
            .add_buffer(Arc::new(FrameBuffer::new(0, 1, Vec::new())))
            .unwrap();
        assert!(request.is_queueable());
        request.mark_queued();
        request.complete(FrameMetadata::default());
        request.reuse().unwrap();
        assert_eq!(request.status(), RequestStatus::Reused);
        assert!(request.buffer().is_some());
        assert!(request.is_queueable());
    }

    #[test]
    fn test_second_buffer_is_rejected() {
        let mut request = Request::new(0);
        request
            .add_buffer(Arc::new(FrameBuffer::new(0, 1, Vec::new())))
            .unwrap();
        let err = request
            .add_buffer(Arc::new(FrameBuffer::new(1, 1, Vec::new())))
            .unwrap_err();
        assert!(matches!(err, CaptureError::BufferBindingFailed(_)));
    }
}
