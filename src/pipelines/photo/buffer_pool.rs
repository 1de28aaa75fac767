// SPDX-License-Identifier: GPL-3.0-only

//! Frame buffers of the configured stream

use crate::backends::camera::CameraDevice;
use crate::backends::camera::types::{FrameBuffer, StreamFormat};
use crate::errors::{CaptureError, CaptureResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns the driver-allocated buffers between allocation and teardown
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Vec<Arc<FrameBuffer>>,
    format: Option<StreamFormat>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate buffers for `format`
    ///
    /// The count is chosen by the driver. A non-empty pool is freed first.
    pub fn allocate(
        &mut self,
        device: &mut dyn CameraDevice,
        format: &StreamFormat,
    ) -> CaptureResult<usize> {
        if !self.buffers.is_empty() {
            self.free(device)?;
        }

        let buffers = device.allocate_buffers().map_err(|e| match e {
            CaptureError::AllocationFailed(_) => e,
            other => CaptureError::AllocationFailed(other.to_string()),
        })?;
        if buffers.is_empty() {
            return Err(CaptureError::NoBuffersAllocated);
        }

        for buffer in &buffers {
            if buffer.planes().is_empty() {
                warn!(index = buffer.index(), "Buffer has no planes; its frames cannot be read");
            } else if !buffer.is_empty() && buffer.len() < format.frame_size() {
                warn!(
                    index = buffer.index(),
                    bytes = buffer.len(),
                    frame_size = format.frame_size(),
                    "Buffer smaller than a frame"
                );
            }
        }

        info!(count = buffers.len(), format = %format, "Frame buffers allocated");
        self.buffers = buffers;
        self.format = Some(*format);
        Ok(self.buffers.len())
    }

    /// Return every buffer to the driver; must run before the device is released
    pub fn free(&mut self, device: &mut dyn CameraDevice) -> CaptureResult<()> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        device.free_buffers()?;
        debug!(count = self.buffers.len(), "Frame buffers freed");
        self.buffers.clear();
        self.format = None;
        Ok(())
    }

    /// Free, then allocate again for `format`
    pub fn reset(
        &mut self,
        device: &mut dyn CameraDevice,
        format: &StreamFormat,
    ) -> CaptureResult<usize> {
        self.free(device)?;
        self.allocate(device, format)
    }

    pub fn buffers(&self) -> &[Arc<FrameBuffer>] {
        &self.buffers
    }

    pub fn get(&self, index: usize) -> Option<&Arc<FrameBuffer>> {
        self.buffers.get(index)
    }

    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::CameraManager;
    use crate::backends::camera::types::StreamRole;
    use crate::backends::camera::virtual_camera::{FaultPlan, VirtualCameraSpec, VirtualPlatform};

    fn configured_device(spec: VirtualCameraSpec) -> (Box<dyn CameraDevice>, StreamFormat) {
        let platform = VirtualPlatform::new().with_camera(spec);
        let mut manager = platform.manager();
        manager.start().unwrap();
        let mut device = manager.acquire("cam0").unwrap();
        let mut config = device
            .generate_configuration(StreamRole::StillCapture)
            .unwrap();
        device.validate(&mut config);
        let format = device.configure(&config).unwrap();
        (device, format)
    }

    #[test]
    fn test_allocate_keeps_driver_count() {
        let (mut device, format) =
            configured_device(VirtualCameraSpec::new("cam0").with_buffer_count(3));
        let mut pool = BufferPool::new();

        assert_eq!(pool.allocate(device.as_mut(), &format).unwrap(), 3);
        assert_eq!(pool.format(), Some(&format));
        assert!(pool.buffers().iter().all(|b| b.len() >= format.frame_size()));

        assert_eq!(pool.reset(device.as_mut(), &format).unwrap(), 3);
        pool.free(device.as_mut()).unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.format(), None);
    }

    #[test]
    fn test_planeless_buffers_are_kept() {
        let (mut device, format) = configured_device(VirtualCameraSpec::new("cam0").with_faults(
            FaultPlan {
                planeless_buffers: true,
                ..FaultPlan::default()
            },
        ));
        let mut pool = BufferPool::new();

        let count = pool.allocate(device.as_mut(), &format).unwrap();
        assert!(count > 0);
        assert!(pool.buffers().iter().all(|b| b.planes().is_empty()));
    }
}
