// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// JPEG quality presets
///
/// Users choose between file size and fidelity. Only affects JPEG output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QualityPreset {
    /// Low quality (high compression)
    Low,
    /// Medium quality (balanced)
    Medium,
    /// High quality (low compression, default)
    #[default]
    High,
    /// Maximum quality (minimal compression)
    Maximum,
}

impl QualityPreset {
    /// All presets, lowest to highest
    pub const ALL: [QualityPreset; 4] = [
        QualityPreset::Low,
        QualityPreset::Medium,
        QualityPreset::High,
        QualityPreset::Maximum,
    ];

    /// Get display name for the preset
    pub fn display_name(&self) -> &'static str {
        match self {
            QualityPreset::Low => "Low",
            QualityPreset::Medium => "Medium",
            QualityPreset::High => "High",
            QualityPreset::Maximum => "Maximum",
        }
    }

    /// Get JPEG quality value (0-100)
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            QualityPreset::Low => 60,
            QualityPreset::Medium => 80,
            QualityPreset::High => 92,
            QualityPreset::Maximum => 98,
        }
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualityPreset::ALL
            .into_iter()
            .find(|preset| preset.display_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown quality '{}' (expected low, medium, high or maximum)", s))
    }
}

/// How long `capture()` waits for the armed frames by default
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Granularity of the capture wait (abort flag is checked this often)
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the completion outcome channel
pub const OUTCOME_CHANNEL_CAPACITY: usize = 32;

/// Frames saved per `capture()` call unless configured otherwise
pub const DEFAULT_MIN_FRAMES: u32 = 1;

/// Default append-only system log
pub const DEFAULT_LOG_FILE: &str = "logs/system.log";

/// Default tracing filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default output file prefix for timestamped names
pub const DEFAULT_FILE_PREFIX: &str = "IMG";

/// Sub-directory of the user's pictures directory used for output
pub const PICTURES_SUBDIR: &str = "stillcam";

/// Virtual camera defaults
pub const VIRTUAL_DEFAULT_WIDTH: u32 = 1920;
pub const VIRTUAL_DEFAULT_HEIGHT: u32 = 1080;
pub const VIRTUAL_DEFAULT_BUFFER_COUNT: u32 = 4;
pub const VIRTUAL_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Buffers requested from the V4L2 driver by the simple capture path
pub const SIMPLE_CAPTURE_BUFFER_COUNT: u32 = 4;

/// Frames discarded by the simple capture path while the sensor settles
pub const SIMPLE_CAPTURE_WARMUP_FRAMES: u32 = 3;

// Process exit codes
pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_INIT_FAILURE: u8 = 1;
pub const EXIT_CAPTURE_FAILURE: u8 = 2;
pub const EXIT_CONFIG_FAILURE: u8 = 3;
pub const EXIT_SIMPLE_FAILURE: u8 = 4;
pub const EXIT_ABORTED: u8 = 130;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_presets_are_ordered() {
        let mut prev = 0u8;
        for preset in QualityPreset::ALL {
            assert!(preset.jpeg_quality() > prev);
            prev = preset.jpeg_quality();
        }
    }

    #[test]
    fn test_quality_from_str() {
        assert_eq!("maximum".parse::<QualityPreset>(), Ok(QualityPreset::Maximum));
        assert_eq!(" Low ".parse::<QualityPreset>(), Ok(QualityPreset::Low));
        assert!("ultra".parse::<QualityPreset>().is_err());
    }
}
