// SPDX-License-Identifier: GPL-3.0-only

//! stillcam - single-shot still capture for libcamera devices
//!
//! The crate drives a camera through the request/completion protocol: acquire
//! a device, negotiate a stream format, allocate buffers, circulate capture
//! requests and persist completed frames as JPEG or PNG files.
//!
//! # Architecture
//!
//! - [`backends`]: camera manager/device traits with the libcamera and virtual backends
//! - [`pipelines`]: the capture session and the simple V4L2/PPM path
//! - [`config`]: user configuration
//! - [`storage`]: output naming and atomic file writes
//! - [`logging`]: tracing setup and the JSON-lines system log
//!
//! # Example
//!
//! ```no_run
//! use stillcam::backends::camera::{CameraBackendType, create_manager};
//! use stillcam::pipelines::photo::{CaptureSession, SessionSettings};
//!
//! let manager = create_manager(CameraBackendType::Virtual)?;
//! let mut session = CaptureSession::new(manager, SessionSettings::default());
//! session.initialize()?;
//! let report = session.capture()?;
//! println!("saved {:?}", report.saved);
//! # Ok::<(), stillcam::errors::CaptureError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod logging;
pub mod pipelines;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use constants::QualityPreset;
pub use errors::{AppError, AppResult, CaptureError, CaptureResult, FrameError};
pub use pipelines::photo::{CaptureReport, CaptureSession, SessionSettings};
