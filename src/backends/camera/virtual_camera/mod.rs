// SPDX-License-Identifier: GPL-3.0-only

//! In-process virtual camera backend
//!
//! Behaves like a libcamera pipeline handler without hardware: buffers are
//! memfd-backed (so completions go through the same mmap path as dmabufs),
//! a dedicated event thread completes requests with color bars, and every
//! failure the pipeline has to survive can be injected through a
//! [`FaultPlan`].
//!
//! ```text
//! ┌──────────────────────┐  Queue(Request)  ┌──────────────────────┐
//! │ VirtualQueue         │─────────────────►│ Event thread         │
//! │ (any thread)         │  Stop            │  pending requests    │
//! └──────────────────────┘─────────────────►│  fills memfd buffers │
//!                                           │  calls the callback  │
//!                                           └──────────────────────┘
//! ```

mod driver;
pub mod pattern;

use crate::backends::camera::types::*;
use crate::backends::camera::{CameraDevice, CameraManager, RequestQueue};
use crate::constants::{
    VIRTUAL_DEFAULT_BUFFER_COUNT, VIRTUAL_DEFAULT_HEIGHT, VIRTUAL_DEFAULT_WIDTH,
    VIRTUAL_FRAME_INTERVAL,
};
use crate::errors::{CaptureError, CaptureResult};
use driver::{DriverMessage, DriverParams, driver_main};
use std::collections::HashSet;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lock a mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Failures a virtual camera injects on purpose
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// `generate_configuration` fails
    pub no_configuration: bool,
    /// Status reported by `validate` (fields are still adjusted)
    pub validation: Option<ConfigurationStatus>,
    /// `configure` refuses every configuration
    pub reject_configuration: bool,
    /// `allocate_buffers` fails
    pub fail_allocation: bool,
    /// `allocate_buffers` succeeds with no buffers
    pub zero_buffers: bool,
    /// Buffers come without memory planes
    pub planeless_buffers: bool,
    /// `create_request` fails once this many requests exist
    pub fail_request_creation_after: Option<u64>,
    /// `attach_buffer` fails
    pub fail_buffer_binding: bool,
    /// `start` fails
    pub fail_start: bool,
    /// `queue` fails once this many requests were queued
    pub fail_queue_after: Option<u64>,
    /// The first N completions are cancelled
    pub cancel_first: usize,
    /// Every completion is cancelled
    pub cancel_all: bool,
    /// The first N completions report one byte used per plane
    pub corrupt_first: usize,
}

/// Description of one simulated camera
#[derive(Debug, Clone)]
pub struct VirtualCameraSpec {
    id: String,
    pixel_format: PixelFormat,
    max_size: Size,
    buffer_count: u32,
    frame_interval: Duration,
    faults: FaultPlan,
}

impl VirtualCameraSpec {
    /// 1080p YUV420 camera with four buffers
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pixel_format: PixelFormat::I420,
            max_size: Size::new(VIRTUAL_DEFAULT_WIDTH, VIRTUAL_DEFAULT_HEIGHT),
            buffer_count: VIRTUAL_DEFAULT_BUFFER_COUNT,
            frame_interval: VIRTUAL_FRAME_INTERVAL,
            faults: FaultPlan::default(),
        }
    }

    /// Native format and maximum resolution
    pub fn with_format(mut self, pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        self.pixel_format = pixel_format;
        self.max_size = Size::new(width, height);
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

struct PlatformState {
    cameras: Mutex<Vec<VirtualCameraSpec>>,
    acquired: Mutex<HashSet<String>>,
    fail_manager_start: bool,
}

/// A set of virtual cameras shared by every manager created from it
///
/// Acquisition is tracked per platform, so two managers of the same platform
/// see each other's locks the way two processes see a real camera.
#[derive(Clone)]
pub struct VirtualPlatform {
    state: Arc<PlatformState>,
}

impl VirtualPlatform {
    /// Platform without cameras
    pub fn new() -> Self {
        Self::build(Vec::new(), false)
    }

    fn build(cameras: Vec<VirtualCameraSpec>, fail_manager_start: bool) -> Self {
        Self {
            state: Arc::new(PlatformState {
                cameras: Mutex::new(cameras),
                acquired: Mutex::new(HashSet::new()),
                fail_manager_start,
            }),
        }
    }

    pub fn with_camera(self, spec: VirtualCameraSpec) -> Self {
        lock(&self.state.cameras).push(spec);
        self
    }

    /// Managers of this platform fail to start
    pub fn failing_manager_start(self) -> Self {
        let cameras = lock(&self.state.cameras).clone();
        Self::build(cameras, true)
    }

    /// Remove a camera, leaving ids listed earlier stale
    pub fn unplug(&self, id: &str) {
        lock(&self.state.cameras).retain(|spec| spec.id != id);
    }

    pub fn is_acquired(&self, id: &str) -> bool {
        lock(&self.state.acquired).contains(id)
    }

    pub fn manager(&self) -> VirtualCameraManager {
        VirtualCameraManager {
            platform: self.clone(),
            running: false,
        }
    }

    fn release(&self, id: &str) {
        lock(&self.state.acquired).remove(id);
    }
}

impl Default for VirtualPlatform {
    /// One default camera named `virtual:0`
    fn default() -> Self {
        Self::new().with_camera(VirtualCameraSpec::new("virtual:0"))
    }
}

/// [`CameraManager`] over a [`VirtualPlatform`]
pub struct VirtualCameraManager {
    platform: VirtualPlatform,
    running: bool,
}

impl CameraManager for VirtualCameraManager {
    fn start(&mut self) -> CaptureResult<()> {
        if self.platform.state.fail_manager_start {
            return Err(CaptureError::ManagerStartFailed(
                "virtual platform refused to start".to_string(),
            ));
        }
        if !self.running {
            debug!("Virtual camera manager started");
        }
        self.running = true;
        Ok(())
    }

    fn camera_ids(&self) -> CaptureResult<Vec<String>> {
        if !self.running {
            return Err(CaptureError::InvalidState(
                "camera manager not started".to_string(),
            ));
        }
        Ok(lock(&self.platform.state.cameras)
            .iter()
            .map(|spec| spec.id.clone())
            .collect())
    }

    fn acquire(&mut self, id: &str) -> CaptureResult<Box<dyn CameraDevice>> {
        if !self.running {
            return Err(CaptureError::InvalidState(
                "camera manager not started".to_string(),
            ));
        }
        let spec = lock(&self.platform.state.cameras)
            .iter()
            .find(|spec| spec.id == id)
            .cloned()
            .ok_or_else(|| CaptureError::DeviceNotFound(id.to_string()))?;

        if !lock(&self.platform.state.acquired).insert(id.to_string()) {
            return Err(CaptureError::DeviceBusy(id.to_string()));
        }

        info!(camera = id, "Virtual camera acquired");
        Ok(Box::new(VirtualCamera::new(spec, self.platform.clone())))
    }

    fn stop(&mut self) {
        if self.running {
            debug!("Virtual camera manager stopped");
        }
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// Queue handle shared between the device and completion callbacks
struct VirtualQueue {
    camera_id: String,
    sender: Mutex<Option<Sender<DriverMessage>>>,
    fail_after: Option<u64>,
    queued: AtomicU64,
}

impl RequestQueue for VirtualQueue {
    fn queue(&self, mut request: Request) -> CaptureResult<()> {
        if !request.is_queueable() {
            return Err(CaptureError::QueueFailed(format!(
                "request {} is {} and cannot be queued",
                request.cookie(),
                request.status()
            )));
        }
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(CaptureError::QueueFailed(format!(
                "camera {} is not streaming",
                self.camera_id
            )));
        };
        if let Some(limit) = self.fail_after
            && self.queued.load(Ordering::SeqCst) >= limit
        {
            return Err(CaptureError::QueueFailed(format!(
                "camera {} refused request {}",
                self.camera_id,
                request.cookie()
            )));
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        request.mark_queued();
        sender
            .send(DriverMessage::Queue(request))
            .map_err(|_| CaptureError::QueueFailed("event thread is gone".to_string()))
    }
}

/// An acquired virtual camera
pub struct VirtualCamera {
    spec: VirtualCameraSpec,
    platform: VirtualPlatform,
    callback: Arc<Mutex<Option<CompletionCallback>>>,
    format: Option<StreamFormat>,
    buffer_count: u32,
    buffers: Vec<Arc<FrameBuffer>>,
    allocation: u64,
    requests_created: u64,
    queue: Arc<VirtualQueue>,
    driver: Option<JoinHandle<()>>,
    released: bool,
}

impl VirtualCamera {
    fn new(spec: VirtualCameraSpec, platform: VirtualPlatform) -> Self {
        let queue = Arc::new(VirtualQueue {
            camera_id: spec.id.clone(),
            sender: Mutex::new(None),
            fail_after: spec.faults.fail_queue_after,
            queued: AtomicU64::new(0),
        });
        Self {
            buffer_count: spec.buffer_count,
            spec,
            platform,
            callback: Arc::new(Mutex::new(None)),
            format: None,
            buffers: Vec::new(),
            allocation: 0,
            requests_created: 0,
            queue,
            driver: None,
            released: false,
        }
    }

    fn configured_format(&self) -> CaptureResult<StreamFormat> {
        self.format.ok_or_else(|| {
            CaptureError::InvalidState(format!("camera {} is not configured", self.spec.id))
        })
    }

    fn create_buffer(&self, index: usize, format: &StreamFormat) -> CaptureResult<FrameBuffer> {
        if self.spec.faults.planeless_buffers {
            return Ok(FrameBuffer::new(index, self.allocation, Vec::new()));
        }

        let name = CString::new(format!("virtual-frame-{}", index))
            .map_err(|e| CaptureError::AllocationFailed(e.to_string()))?;
        // SAFETY: name is a valid C string; the result is checked
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(CaptureError::AllocationFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        // SAFETY: memfd_create returned a fresh descriptor we now own
        let file = unsafe { File::from_raw_fd(raw) };
        file.set_len(format.frame_size() as u64)
            .map_err(|e| CaptureError::AllocationFailed(e.to_string()))?;

        let fd = Arc::new(OwnedFd::from(file));
        let planes = format
            .plane_layout()
            .into_iter()
            .map(|(offset, length)| Plane::new(Arc::clone(&fd), offset, length))
            .collect();
        Ok(FrameBuffer::new(index, self.allocation, planes))
    }

    fn shutdown(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = CameraDevice::stop(self) {
            warn!(camera = %self.spec.id, error = %e, "Failed to stop virtual camera");
        }
        if let Err(e) = self.free_buffers() {
            warn!(camera = %self.spec.id, error = %e, "Failed to free virtual buffers");
        }
        self.platform.release(&self.spec.id);
        self.released = true;
        info!(camera = %self.spec.id, "Virtual camera released");
    }
}

impl CameraDevice for VirtualCamera {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn on_request_completed(&mut self, callback: CompletionCallback) {
        *lock(&self.callback) = Some(callback);
    }

    fn generate_configuration(&mut self, role: StreamRole) -> CaptureResult<StreamConfiguration> {
        if self.spec.faults.no_configuration {
            return Err(CaptureError::ConfigurationUnavailable(format!(
                "camera {} has no {} stream",
                self.spec.id, role
            )));
        }
        let size = self.spec.max_size;
        Ok(StreamConfiguration {
            role,
            pixel_format: self.spec.pixel_format,
            size,
            stride: self.spec.pixel_format.min_stride(size.width),
            frame_size: 0,
            buffer_count: self.spec.buffer_count,
        })
    }

    fn validate(&mut self, config: &mut StreamConfiguration) -> ConfigurationStatus {
        let original = config.clone();
        let max = self.spec.max_size;

        config.pixel_format = self.spec.pixel_format;
        config.size.width = config.size.width.clamp(2, max.width.max(2));
        config.size.height = config.size.height.clamp(2, max.height.max(2));
        if !config.pixel_format.is_compressed() {
            // 4:2:0 and 4:2:2 need even dimensions
            config.size.width &= !1;
            config.size.height &= !1;
        }
        config.stride = config
            .stride
            .max(config.pixel_format.min_stride(config.size.width));
        let frame_size = config
            .pixel_format
            .frame_size(config.size.width, config.size.height, config.stride);
        config.frame_size = u32::try_from(frame_size).unwrap_or(u32::MAX);
        if config.buffer_count == 0 {
            config.buffer_count = self.spec.buffer_count;
        }

        // frame_size is always driver-owned, so it doesn't count as an adjustment
        let mut compared = original;
        compared.frame_size = config.frame_size;
        let status = if compared == *config {
            ConfigurationStatus::Valid
        } else {
            ConfigurationStatus::Adjusted
        };
        self.spec.faults.validation.unwrap_or(status)
    }

    fn configure(&mut self, config: &StreamConfiguration) -> CaptureResult<StreamFormat> {
        if self.is_streaming() {
            return Err(CaptureError::InvalidState(format!(
                "camera {} is streaming",
                self.spec.id
            )));
        }
        if self.spec.faults.reject_configuration {
            return Err(CaptureError::ConfigurationRejected(format!(
                "camera {} refused {}",
                self.spec.id, config
            )));
        }
        let max = self.spec.max_size;
        if config.pixel_format != self.spec.pixel_format
            || config.size.width == 0
            || config.size.height == 0
            || config.size.width > max.width
            || config.size.height > max.height
        {
            return Err(CaptureError::ConfigurationRejected(format!(
                "camera {} does not support {}",
                self.spec.id, config
            )));
        }

        let format = StreamFormat::from_configuration(config);
        self.format = Some(format);
        self.buffer_count = config.buffer_count.max(1);
        debug!(camera = %self.spec.id, format = %format, "Virtual camera configured");
        Ok(format)
    }

    fn allocate_buffers(&mut self) -> CaptureResult<Vec<Arc<FrameBuffer>>> {
        let format = self.configured_format()?;
        if self.spec.faults.fail_allocation {
            return Err(CaptureError::AllocationFailed(format!(
                "camera {} is out of buffer memory",
                self.spec.id
            )));
        }
        if !self.buffers.is_empty() {
            self.free_buffers()?;
        }

        self.allocation += 1;
        let count = if self.spec.faults.zero_buffers {
            0
        } else {
            self.buffer_count as usize
        };
        let buffers = (0..count)
            .map(|index| self.create_buffer(index, &format).map(Arc::new))
            .collect::<CaptureResult<Vec<_>>>()?;

        debug!(
            camera = %self.spec.id,
            count = buffers.len(),
            frame_size = format.frame_size(),
            "Virtual buffers allocated"
        );
        self.buffers = buffers.clone();
        Ok(buffers)
    }

    fn free_buffers(&mut self) -> CaptureResult<()> {
        if self.is_streaming() {
            return Err(CaptureError::InvalidState(format!(
                "camera {} is streaming",
                self.spec.id
            )));
        }
        if !self.buffers.is_empty() {
            debug!(camera = %self.spec.id, count = self.buffers.len(), "Virtual buffers freed");
        }
        self.buffers.clear();
        Ok(())
    }

    fn create_request(&mut self, cookie: u64) -> CaptureResult<Request> {
        self.configured_format()?;
        if let Some(limit) = self.spec.faults.fail_request_creation_after
            && self.requests_created >= limit
        {
            return Err(CaptureError::RequestCreationFailed(format!(
                "camera {} cannot create request {}",
                self.spec.id, cookie
            )));
        }
        self.requests_created += 1;
        Ok(Request::new(cookie))
    }

    fn attach_buffer(
        &mut self,
        request: &mut Request,
        buffer: &Arc<FrameBuffer>,
    ) -> CaptureResult<()> {
        if self.spec.faults.fail_buffer_binding {
            return Err(CaptureError::BufferBindingFailed(format!(
                "camera {} rejected buffer {}",
                self.spec.id,
                buffer.index()
            )));
        }
        if buffer.allocation() != self.allocation
            || !self.buffers.iter().any(|own| Arc::ptr_eq(own, buffer))
        {
            return Err(CaptureError::BufferBindingFailed(format!(
                "buffer {} was not allocated for the current stream",
                buffer.index()
            )));
        }
        request.add_buffer(Arc::clone(buffer))
    }

    fn start(&mut self) -> CaptureResult<()> {
        let format = self.configured_format()?;
        if self.is_streaming() {
            return Err(CaptureError::InvalidState(format!(
                "camera {} is already streaming",
                self.spec.id
            )));
        }
        if self.spec.faults.fail_start {
            return Err(CaptureError::StartFailed(format!(
                "camera {} failed to start",
                self.spec.id
            )));
        }

        let (tx, rx) = mpsc::channel();
        let params = DriverParams {
            camera_id: self.spec.id.clone(),
            format,
            frame_interval: self.spec.frame_interval,
            faults: self.spec.faults.clone(),
            callback: Arc::clone(&self.callback),
        };
        let handle = std::thread::Builder::new()
            .name("virtual-camera".to_string())
            .spawn(move || driver_main(params, rx))
            .map_err(|e| CaptureError::StartFailed(format!("spawn event thread: {}", e)))?;

        *lock(&self.queue.sender) = Some(tx);
        self.driver = Some(handle);
        Ok(())
    }

    fn request_queue(&self) -> Arc<dyn RequestQueue> {
        self.queue.clone()
    }

    fn stop(&mut self) -> CaptureResult<()> {
        let Some(handle) = self.driver.take() else {
            return Ok(());
        };

        // No new submissions from here on; the stop message is the last one
        if let Some(sender) = lock(&self.queue.sender).take() {
            let _ = sender.send(DriverMessage::Stop);
        }

        if let Err(e) = handle.join() {
            error!(camera = %self.spec.id, "Virtual camera event thread panicked: {:?}", e);
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.driver.is_some()
    }

    fn release(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    fn started_manager(platform: &VirtualPlatform) -> VirtualCameraManager {
        let mut manager = platform.manager();
        manager.start().unwrap();
        manager
    }

    fn configured(camera: &mut Box<dyn CameraDevice>) -> StreamFormat {
        let mut config = camera
            .generate_configuration(StreamRole::StillCapture)
            .unwrap();
        camera.validate(&mut config);
        camera.configure(&config).unwrap()
    }

    #[test]
    fn test_acquire_is_exclusive_across_managers() {
        let platform = VirtualPlatform::default();
        let mut first = started_manager(&platform);
        let mut second = started_manager(&platform);

        let camera = first.acquire("virtual:0").unwrap();
        let err = second.acquire("virtual:0").err().unwrap();
        assert_eq!(err, CaptureError::DeviceBusy("virtual:0".to_string()));

        camera.release();
        assert!(!platform.is_acquired("virtual:0"));
        assert!(second.acquire("virtual:0").is_ok());
    }

    #[test]
    fn test_unplugged_camera_is_not_found() {
        let platform = VirtualPlatform::default();
        let mut manager = started_manager(&platform);
        let ids = manager.camera_ids().unwrap();
        platform.unplug(&ids[0]);
        let err = manager.acquire(&ids[0]).err().unwrap();
        assert!(matches!(err, CaptureError::DeviceNotFound(_)));
    }

    #[test]
    fn test_validate_adjusts_odd_size() {
        let platform = VirtualPlatform::default();
        let mut manager = started_manager(&platform);
        let mut camera = manager.acquire("virtual:0").unwrap();
        let mut config = camera
            .generate_configuration(StreamRole::StillCapture)
            .unwrap();
        assert_eq!(camera.validate(&mut config), ConfigurationStatus::Valid);

        config.size = Size::new(641, 481);
        assert_eq!(camera.validate(&mut config), ConfigurationStatus::Adjusted);
        assert_eq!(config.size, Size::new(640, 480));
    }

    #[test]
    fn test_buffers_have_planes_per_format() {
        let platform = VirtualPlatform::new().with_camera(
            VirtualCameraSpec::new("nv12")
                .with_format(PixelFormat::NV12, 64, 48)
                .with_buffer_count(3),
        );
        let mut manager = started_manager(&platform);
        let mut camera = manager.acquire("nv12").unwrap();
        configured(&mut camera);
        let buffers = camera.allocate_buffers().unwrap();
        assert_eq!(buffers.len(), 3);
        assert!(buffers.iter().all(|buffer| buffer.planes().len() == 2));
    }

    #[test]
    fn test_stop_cancels_queued_requests() {
        let platform = VirtualPlatform::new().with_camera(
            VirtualCameraSpec::new("slow")
                .with_format(PixelFormat::RGB888, 16, 16)
                .with_frame_interval(Duration::from_secs(60)),
        );
        let mut manager = started_manager(&platform);
        let mut camera = manager.acquire("slow").unwrap();
        configured(&mut camera);
        let buffers = camera.allocate_buffers().unwrap();

        let (tx, rx) = sync_channel(8);
        camera.on_request_completed(Box::new(move |request| {
            let _ = tx.try_send(request.status());
        }));

        let mut request = camera.create_request(0).unwrap();
        camera.attach_buffer(&mut request, &buffers[0]).unwrap();
        camera.start().unwrap();
        camera.request_queue().queue(request).unwrap();
        camera.stop().unwrap();

        assert_eq!(rx.try_recv().unwrap(), RequestStatus::Cancelled);
        assert!(!camera.is_streaming());
    }

    #[test]
    fn test_queue_requires_streaming() {
        let platform = VirtualPlatform::default();
        let mut manager = started_manager(&platform);
        let mut camera = manager.acquire("virtual:0").unwrap();
        configured(&mut camera);
        let buffers = camera.allocate_buffers().unwrap();
        let mut request = camera.create_request(0).unwrap();
        camera.attach_buffer(&mut request, &buffers[0]).unwrap();
        let err = camera.request_queue().queue(request).unwrap_err();
        assert!(matches!(err, CaptureError::QueueFailed(_)));
    }

    #[test]
    fn test_stale_buffer_binding_rejected() {
        let platform = VirtualPlatform::default();
        let mut manager = started_manager(&platform);
        let mut camera = manager.acquire("virtual:0").unwrap();
        configured(&mut camera);
        let old = camera.allocate_buffers().unwrap();
        camera.allocate_buffers().unwrap();
        let mut request = camera.create_request(0).unwrap();
        let err = camera.attach_buffer(&mut request, &old[0]).unwrap_err();
        assert!(matches!(err, CaptureError::BufferBindingFailed(_)));
    }
}
