// SPDX-License-Identifier: GPL-3.0-only

//! Stream configuration negotiation
//!
//! generate (per role) → optional size override → validate → apply.
//! The driver's validation verdict is advisory; only a refused `apply` is
//! fatal, and it is never retried.

use crate::backends::camera::CameraDevice;
use crate::backends::camera::types::{
    ConfigurationStatus, Size, StreamConfiguration, StreamFormat, StreamRole,
};
use crate::errors::{CaptureError, CaptureResult};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ConfigurationNegotiator {
    requested_size: Option<Size>,
}

impl ConfigurationNegotiator {
    /// `requested_size` replaces the role's default size before validation
    pub fn new(requested_size: Option<Size>) -> Self {
        Self { requested_size }
    }

    /// Default configuration for `role`
    ///
    /// The driver already picks the largest size for the role, so no
    /// resolution probing happens here.
    pub fn negotiate(
        &self,
        device: &mut dyn CameraDevice,
        role: StreamRole,
    ) -> CaptureResult<StreamConfiguration> {
        let mut config = device.generate_configuration(role).map_err(|e| match e {
            CaptureError::ConfigurationUnavailable(_) => e,
            other => CaptureError::ConfigurationUnavailable(other.to_string()),
        })?;
        debug!(role = %role, config = %config, "Default configuration generated");

        if let Some(size) = self.requested_size
            && size != config.size
        {
            debug!(from = %config.size, to = %size, "Overriding configuration size");
            config.size = size;
            // Let the driver recompute layout for the new size
            config.stride = 0;
            config.frame_size = 0;
        }
        Ok(config)
    }

    /// Let the driver adjust `config`; the adjusted values are kept
    pub fn validate(
        &self,
        device: &mut dyn CameraDevice,
        config: &mut StreamConfiguration,
    ) -> ConfigurationStatus {
        let requested = config.clone();
        let status = device.validate(config);
        match status {
            ConfigurationStatus::Valid => debug!(config = %config, "Configuration valid"),
            ConfigurationStatus::Adjusted => info!(
                requested = %requested,
                adjusted = %config,
                "Camera configuration adjusted by driver"
            ),
            ConfigurationStatus::Invalid => warn!(
                requested = %requested,
                adjusted = %config,
                "Driver reported configuration as invalid, applying it anyway"
            ),
        }
        status
    }

    /// Commit `config` to the device
    pub fn apply(
        &self,
        device: &mut dyn CameraDevice,
        config: &StreamConfiguration,
    ) -> CaptureResult<StreamFormat> {
        let format = device.configure(config).map_err(|e| match e {
            CaptureError::ConfigurationRejected(_) => e,
            other => CaptureError::ConfigurationRejected(other.to_string()),
        })?;
        info!(
            camera = device.id(),
            format = %format,
            frame_size = format.frame_size(),
            "Camera configured"
        );
        Ok(format)
    }

    /// negotiate → validate → apply
    pub fn configure(
        &self,
        device: &mut dyn CameraDevice,
        role: StreamRole,
    ) -> CaptureResult<StreamFormat> {
        let mut config = self.negotiate(device, role)?;
        self.validate(device, &mut config);
        self.apply(device, &config)
    }
}
