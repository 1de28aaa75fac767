// SPDX-License-Identifier: GPL-3.0-only

//! Camera backend abstraction
//!
//! The capture pipeline is written against three traits modelled on the
//! libcamera request/completion API:
//!
//! ```text
//! ┌─────────────────────┐
//! │   CaptureSession    │
//! └──────────┬──────────┘
//!            │
//!            ▼
//! ┌─────────────────────┐
//! │ CameraManager trait │  ← start, list, acquire, stop
//! └──────────┬──────────┘
//!            │ acquire
//!            ▼
//! ┌─────────────────────┐      ┌───────────────────┐
//! │ CameraDevice trait  │─────►│ RequestQueue      │ ← requeue from the
//! └──────────┬──────────┘      └───────────────────┘   driver thread
//!            │
//!       ┌────┴─────┐
//!       ▼          ▼
//!  ┌─────────┐ ┌─────────┐
//!  │libcamera│ │ Virtual │
//!  └─────────┘ └─────────┘
//! ```
//!
//! Every device backend owns one event thread. Completed requests are handed
//! to the callback registered with [`CameraDevice::on_request_completed`] on
//! that thread.

#[cfg(feature = "libcamera")]
pub mod libcamera;
pub mod mapping;
pub mod types;
pub mod virtual_camera;

pub use mapping::MappedPlane;
pub use types::*;

use crate::errors::CaptureResult;
use std::sync::Arc;

/// Platform camera manager
pub trait CameraManager: Send {
    /// Start the manager. Must succeed before any other call.
    fn start(&mut self) -> CaptureResult<()>;

    /// Ids of every camera the manager currently sees
    fn camera_ids(&self) -> CaptureResult<Vec<String>>;

    /// Open and exclusively lock a camera
    ///
    /// # Errors
    /// * `DeviceNotFound` - the id is unknown (or stale)
    /// * `DeviceBusy` - the camera is held by someone else
    fn acquire(&mut self, id: &str) -> CaptureResult<Box<dyn CameraDevice>>;

    /// Stop the manager. Calling it on a stopped manager does nothing.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// An acquired camera
///
/// Dropping a device releases it; [`CameraDevice::release`] does the same
/// explicitly so callers control the order of teardown.
pub trait CameraDevice: Send {
    fn id(&self) -> &str;

    /// Register the sole completion subscriber, replacing any previous one
    fn on_request_completed(&mut self, callback: CompletionCallback);

    /// Default configuration for a stream role
    fn generate_configuration(&mut self, role: StreamRole) -> CaptureResult<StreamConfiguration>;

    /// Let the driver adjust `config` in place
    fn validate(&mut self, config: &mut StreamConfiguration) -> ConfigurationStatus;

    /// Apply a configuration and return the negotiated format
    fn configure(&mut self, config: &StreamConfiguration) -> CaptureResult<StreamFormat>;

    /// Allocate the driver-determined number of buffers for the configured stream
    fn allocate_buffers(&mut self) -> CaptureResult<Vec<Arc<FrameBuffer>>>;

    /// Free every buffer handed out by [`CameraDevice::allocate_buffers`]
    fn free_buffers(&mut self) -> CaptureResult<()>;

    fn create_request(&mut self, cookie: u64) -> CaptureResult<Request>;

    /// Bind `buffer` to the configured stream of `request`
    fn attach_buffer(&mut self, request: &mut Request, buffer: &Arc<FrameBuffer>)
    -> CaptureResult<()>;

    /// Start streaming; required before queuing requests
    fn start(&mut self) -> CaptureResult<()>;

    /// Handle for queuing requests, usable from any thread
    fn request_queue(&self) -> Arc<dyn RequestQueue>;

    /// Stop streaming; every queued request completes as cancelled
    /// before this returns
    fn stop(&mut self) -> CaptureResult<()>;

    fn is_streaming(&self) -> bool;

    /// Release the exclusive lock and close the camera
    fn release(self: Box<Self>);
}

/// Thread-safe request submission
pub trait RequestQueue: Send + Sync {
    /// Hand a request to the device
    ///
    /// Fails with `QueueFailed` when the device is not streaming or the
    /// request has no buffer or is not in a queueable state; the request is
    /// dropped in that case.
    fn queue(&self, request: Request) -> CaptureResult<()>;
}

/// Create the camera manager for a backend
///
/// Requesting libcamera without the `libcamera` feature yields
/// `BackendUnavailable`.
pub fn create_manager(backend: CameraBackendType) -> CaptureResult<Box<dyn CameraManager>> {
    match backend {
        CameraBackendType::Virtual => Ok(Box::new(
            virtual_camera::VirtualPlatform::default().manager(),
        )),
        #[cfg(feature = "libcamera")]
        CameraBackendType::Libcamera => Ok(Box::new(libcamera::LibcameraManager::new())),
        #[cfg(not(feature = "libcamera"))]
        CameraBackendType::Libcamera => Err(crate::errors::CaptureError::BackendUnavailable(
            "built without the libcamera feature".to_string(),
        )),
    }
}

/// Log-friendly summary of the backends compiled in
pub fn available_backends() -> Vec<CameraBackendType> {
    let mut backends = Vec::new();
    #[cfg(feature = "libcamera")]
    backends.push(CameraBackendType::Libcamera);
    backends.push(CameraBackendType::Virtual);
    backends
}
