// SPDX-License-Identifier: GPL-3.0-only

//! Capture pipelines
//!
//! - [`photo`]: request/completion pipeline on top of a camera backend
//! - [`simple`]: one-frame V4L2 grab written as PPM, for sensors without a
//!   libcamera pipeline handler

pub mod photo;
pub mod simple;
