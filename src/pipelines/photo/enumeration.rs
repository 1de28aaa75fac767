// SPDX-License-Identifier: GPL-3.0-only

//! Device discovery, selection and acquisition

use crate::backends::camera::types::CompletionCallback;
use crate::backends::camera::{CameraDevice, CameraManager};
use crate::errors::{CaptureError, CaptureResult};
use tracing::{debug, info};

/// Which camera to open
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    /// The first camera the manager lists
    #[default]
    First,
    /// Position in the manager's list
    Index(usize),
    /// Exact camera id
    Id(String),
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::First => write!(f, "first camera"),
            DeviceSelector::Index(index) => write!(f, "camera #{}", index),
            DeviceSelector::Id(id) => write!(f, "camera '{}'", id),
        }
    }
}

/// Wraps the platform camera manager for the session
pub struct DeviceEnumerator {
    manager: Box<dyn CameraManager>,
}

impl DeviceEnumerator {
    pub fn new(manager: Box<dyn CameraManager>) -> Self {
        Self { manager }
    }

    /// Start the platform camera manager
    pub fn start(&mut self) -> CaptureResult<()> {
        self.manager.start().map_err(|e| match e {
            CaptureError::ManagerStartFailed(_) => e,
            other => CaptureError::ManagerStartFailed(other.to_string()),
        })?;
        debug!("Camera manager started");
        Ok(())
    }

    /// Ids of the available cameras; an empty list is `NoDeviceFound`
    pub fn list_devices(&self) -> CaptureResult<Vec<String>> {
        let ids = self.manager.camera_ids()?;
        if ids.is_empty() {
            return Err(CaptureError::NoDeviceFound);
        }
        debug!(count = ids.len(), "Cameras enumerated");
        Ok(ids)
    }

    /// Pick one id from `ids`
    pub fn select(ids: &[String], selector: &DeviceSelector) -> CaptureResult<String> {
        match selector {
            DeviceSelector::First => ids.first().cloned().ok_or(CaptureError::NoDeviceFound),
            DeviceSelector::Index(index) => ids
                .get(*index)
                .cloned()
                .ok_or_else(|| CaptureError::DeviceNotFound(format!("#{}", index))),
            DeviceSelector::Id(id) => ids
                .iter()
                .find(|candidate| *candidate == id)
                .cloned()
                .ok_or_else(|| CaptureError::DeviceNotFound(id.clone())),
        }
    }

    /// Open and lock a camera and make `callback` its only completion subscriber
    pub fn acquire(
        &mut self,
        id: &str,
        callback: CompletionCallback,
    ) -> CaptureResult<Box<dyn CameraDevice>> {
        let mut device = self.manager.acquire(id)?;
        device.on_request_completed(callback);
        info!(camera = id, "Camera acquired");
        Ok(device)
    }

    /// Stop the manager; harmless when already stopped
    pub fn stop(&mut self) {
        if self.manager.is_running() {
            self.manager.stop();
            debug!("Camera manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<String> {
        vec!["/base/imx708".to_string(), "/base/usb-cam".to_string()]
    }

    #[test]
    fn test_select_first_and_index() {
        assert_eq!(
            DeviceEnumerator::select(&ids(), &DeviceSelector::First).unwrap(),
            "/base/imx708"
        );
        assert_eq!(
            DeviceEnumerator::select(&ids(), &DeviceSelector::Index(1)).unwrap(),
            "/base/usb-cam"
        );
    }

    #[test]
    fn test_select_unknown_is_not_found() {
        let err = DeviceEnumerator::select(&ids(), &DeviceSelector::Index(5)).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceNotFound(_)));

        let err =
            DeviceEnumerator::select(&ids(), &DeviceSelector::Id("nope".to_string())).unwrap_err();
        assert_eq!(err, CaptureError::DeviceNotFound("nope".to_string()));
    }

    #[test]
    fn test_select_from_empty_list() {
        let err = DeviceEnumerator::select(&[], &DeviceSelector::First).unwrap_err();
        assert_eq!(err, CaptureError::NoDeviceFound);
    }
}
