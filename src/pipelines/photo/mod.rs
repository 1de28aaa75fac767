// SPDX-License-Identifier: GPL-3.0-only

//! Still capture pipeline
//!
//! ```text
//! DeviceEnumerator → ConfigurationNegotiator → BufferPool      (initialize)
//!                                                  │
//!                                          RequestScheduler    (capture)
//!                                                  │ queue
//!                                                  ▼
//!                               ┌──── camera event thread ────┐
//!                               │ CompletionHandler            │
//!                               │  map → decode → encode →     │
//!                               │  write → requeue             │
//!                               └──────────────────────────────┘
//! ```
//!
//! [`CaptureSession`] drives the stages and owns every resource; the
//! completion handler reports back through a bounded channel.

pub mod buffer_pool;
pub mod completion;
pub mod encoding;
pub mod enumeration;
pub mod negotiation;
pub mod processing;
pub mod scheduler;
pub mod session;

pub use buffer_pool::BufferPool;
pub use completion::{CompletionStats, FrameOutcome};
pub use encoding::{EncodingFormat, PhotoEncoder};
pub use enumeration::{DeviceEnumerator, DeviceSelector};
pub use negotiation::ConfigurationNegotiator;
pub use processing::{CapturedImage, decode_frame};
pub use scheduler::RequestScheduler;
pub use session::{CaptureReport, CaptureSession, SessionSettings, SessionState};
