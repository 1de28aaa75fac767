// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the still capture pipeline
//!
//! Errors are split by blast radius:
//! - [`CaptureError`]: fatal to the whole session, returned synchronously
//! - [`FrameError`]: fatal to one frame only, reported from the completion path
//! - [`AppError`]: process-level errors surfaced by the CLI

use std::fmt;
use std::time::Duration;

/// Result type for session-level operations
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Session-level errors. Any of these aborts the session; teardown still runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The platform camera manager could not be started
    ManagerStartFailed(String),
    /// The camera manager reported no devices
    NoDeviceFound,
    /// The requested device id or index does not exist (or is stale)
    DeviceNotFound(String),
    /// The device is already acquired by another session or process
    DeviceBusy(String),
    /// The driver could not produce a default configuration for the role
    ConfigurationUnavailable(String),
    /// The driver refused the configuration
    ConfigurationRejected(String),
    /// The driver failed to allocate frame buffers
    AllocationFailed(String),
    /// The driver allocated zero frame buffers
    NoBuffersAllocated,
    /// The device could not create a request
    RequestCreationFailed(String),
    /// The driver rejected a buffer/stream pairing
    BufferBindingFailed(String),
    /// The device could not be started
    StartFailed(String),
    /// A request could not be queued to the device
    QueueFailed(String),
    /// Operation needs a state the session is not in
    InvalidState(String),
    /// No frame was saved before the deadline
    Timeout {
        /// How long the session waited
        waited: Duration,
        /// Frames that failed while waiting
        failed: u64,
    },
    /// Every in-flight request came back cancelled
    AllRequestsCancelled,
    /// The wait was interrupted by the abort flag
    Aborted,
    /// Backend not compiled in or not usable on this system
    BackendUnavailable(String),
}

impl CaptureError {
    /// True for errors raised while bringing the session up (initialize)
    pub fn is_initialization_error(&self) -> bool {
        matches!(
            self,
            CaptureError::ManagerStartFailed(_)
                | CaptureError::NoDeviceFound
                | CaptureError::DeviceNotFound(_)
                | CaptureError::DeviceBusy(_)
                | CaptureError::ConfigurationUnavailable(_)
                | CaptureError::ConfigurationRejected(_)
                | CaptureError::AllocationFailed(_)
                | CaptureError::NoBuffersAllocated
                | CaptureError::BackendUnavailable(_)
        )
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::ManagerStartFailed(msg) => {
                write!(f, "Failed to start camera manager: {}", msg)
            }
            CaptureError::NoDeviceFound => write!(f, "No camera devices found"),
            CaptureError::DeviceNotFound(id) => write!(f, "Camera '{}' not found", id),
            CaptureError::DeviceBusy(id) => write!(f, "Camera '{}' is busy", id),
            CaptureError::ConfigurationUnavailable(msg) => {
                write!(f, "No configuration available: {}", msg)
            }
            CaptureError::ConfigurationRejected(msg) => {
                write!(f, "Configuration rejected: {}", msg)
            }
            CaptureError::AllocationFailed(msg) => write!(f, "Buffer allocation failed: {}", msg),
            CaptureError::NoBuffersAllocated => write!(f, "No buffers allocated"),
            CaptureError::RequestCreationFailed(msg) => {
                write!(f, "Request creation failed: {}", msg)
            }
            CaptureError::BufferBindingFailed(msg) => write!(f, "Buffer binding failed: {}", msg),
            CaptureError::StartFailed(msg) => write!(f, "Failed to start camera: {}", msg),
            CaptureError::QueueFailed(msg) => write!(f, "Failed to queue request: {}", msg),
            CaptureError::InvalidState(msg) => write!(f, "Invalid session state: {}", msg),
            CaptureError::Timeout { waited, failed } => write!(
                f,
                "No frame captured within {} ms ({} frame(s) failed)",
                waited.as_millis(),
                failed
            ),
            CaptureError::AllRequestsCancelled => write!(f, "All capture requests were cancelled"),
            CaptureError::Aborted => write!(f, "Capture aborted"),
            CaptureError::BackendUnavailable(msg) => write!(f, "Backend not available: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Per-frame errors. Reported and counted, never propagated out of `capture()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The driver cancelled the request
    Cancelled,
    /// The completed buffer has no addressable memory planes
    NoPlanes,
    /// The plane could not be mapped into the process
    MapFailed(String),
    /// The mapped bytes could not be decoded with the negotiated format
    DecodeFailed(String),
    /// The image could not be encoded
    EncodeFailed(String),
    /// The encoded image could not be written
    WriteFailed(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Cancelled => write!(f, "Request cancelled"),
            FrameError::NoPlanes => write!(f, "Buffer has no planes"),
            FrameError::MapFailed(msg) => write!(f, "Failed to map buffer: {}", msg),
            FrameError::DecodeFailed(msg) => write!(f, "Decode failed: {}", msg),
            FrameError::EncodeFailed(msg) => write!(f, "Encoding failed: {}", msg),
            FrameError::WriteFailed(msg) => write!(f, "Save failed: {}", msg),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::WriteFailed(err.to_string())
    }
}

/// Main application error type
#[derive(Debug, Clone)]
pub enum AppError {
    /// Capture session errors
    Capture(CaptureError),
    /// Simple (V4L2 + PPM) capture errors
    SimpleCapture(String),
    /// Configuration errors
    Config(String),
    /// Storage/filesystem errors
    Storage(String),
    /// Generic error with message
    Other(String),
}

impl AppError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Capture(CaptureError::Aborted) => crate::constants::EXIT_ABORTED,
            AppError::Capture(e) if e.is_initialization_error() => {
                crate::constants::EXIT_INIT_FAILURE
            }
            AppError::Capture(_) => crate::constants::EXIT_CAPTURE_FAILURE,
            AppError::Config(_) => crate::constants::EXIT_CONFIG_FAILURE,
            AppError::SimpleCapture(_) => crate::constants::EXIT_SIMPLE_FAILURE,
            AppError::Storage(_) | AppError::Other(_) => crate::constants::EXIT_CAPTURE_FAILURE,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Capture(e) => write!(f, "Capture error: {}", e),
            AppError::SimpleCapture(msg) => write!(f, "Simple capture error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Storage(msg) => write!(f, "Storage error: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        AppError::Capture(err)
    }
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Other(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Other(msg.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}
