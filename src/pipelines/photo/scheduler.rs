// SPDX-License-Identifier: GPL-3.0-only

//! Request construction and submission
//!
//! Requests are built once per session (one per buffer) and then circulate
//! between the device and the completion handler. The scheduler only holds
//! them between build and submit.

use super::buffer_pool::BufferPool;
use crate::backends::camera::types::Request;
use crate::backends::camera::{CameraDevice, RequestQueue};
use crate::errors::{CaptureError, CaptureResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct RequestScheduler {
    built: Vec<Request>,
}

impl RequestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build exactly one request per pooled buffer, cookie = buffer index
    ///
    /// All or nothing: on the first failure every request built so far is
    /// dropped.
    pub fn build_requests(
        &mut self,
        device: &mut dyn CameraDevice,
        pool: &BufferPool,
    ) -> CaptureResult<usize> {
        self.built.clear();

        let mut batch = Vec::with_capacity(pool.len());
        for buffer in pool.buffers() {
            let mut request = device
                .create_request(buffer.index() as u64)
                .map_err(|e| match e {
                    CaptureError::RequestCreationFailed(_) => e,
                    other => CaptureError::RequestCreationFailed(other.to_string()),
                })?;
            device
                .attach_buffer(&mut request, buffer)
                .map_err(|e| match e {
                    CaptureError::BufferBindingFailed(_) => e,
                    other => CaptureError::BufferBindingFailed(other.to_string()),
                })?;
            batch.push(request);
        }

        debug!(count = batch.len(), "Capture requests built");
        self.built = batch;
        Ok(self.built.len())
    }

    /// Start streaming; harmless when the device already streams
    pub fn start(&mut self, device: &mut dyn CameraDevice) -> CaptureResult<()> {
        if device.is_streaming() {
            return Ok(());
        }
        device.start().map_err(|e| match e {
            CaptureError::StartFailed(_) => e,
            other => CaptureError::StartFailed(other.to_string()),
        })?;
        info!(camera = device.id(), "Camera started");
        Ok(())
    }

    /// Queue every built request in build order
    ///
    /// `in_flight` is raised before each hand-off, since the completion can
    /// run on the driver thread before `queue` returns. The first failure
    /// aborts the batch; the unsubmitted rest is dropped.
    pub fn submit(&mut self, queue: &dyn RequestQueue, in_flight: &AtomicUsize) -> CaptureResult<usize> {
        let mut submitted = 0;
        for request in std::mem::take(&mut self.built) {
            let cookie = request.cookie();
            in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = queue.queue(request) {
                in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(match e {
                    CaptureError::QueueFailed(_) => e,
                    other => CaptureError::QueueFailed(format!("request {}: {}", cookie, other)),
                });
            }
            submitted += 1;
        }
        debug!(count = submitted, "Capture requests queued");
        Ok(submitted)
    }

    /// Requests built but not yet submitted
    pub fn pending(&self) -> usize {
        self.built.len()
    }

    pub fn clear(&mut self) {
        self.built.clear();
    }
}
