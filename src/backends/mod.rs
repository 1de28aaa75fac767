// SPDX-License-Identifier: GPL-3.0-only

//! Hardware access
//!
//! - [`camera`]: camera manager/device traits and their backends

pub mod camera;
