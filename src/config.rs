// SPDX-License-Identifier: GPL-3.0-only

//! Persistent configuration
//!
//! Stored as JSON (`~/.config/stillcam/config.json` by default). Every field
//! has a default, so partial files and files from older versions load fine.
//! Command-line options override individual fields at startup.

use crate::backends::camera::types::{CameraBackendType, Size, StreamRole};
use crate::constants::{
    DEFAULT_CAPTURE_TIMEOUT, DEFAULT_FILE_PREFIX, DEFAULT_LOG_FILE, DEFAULT_MIN_FRAMES,
    QualityPreset,
};
use crate::errors::{AppError, AppResult};
use crate::pipelines::photo::DeviceSelector;
use crate::storage::{self, OutputNaming};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Image file format for captured photos
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum PhotoOutputFormat {
    /// JPEG, quality from the configured preset
    #[default]
    Jpeg,
    /// Lossless PNG
    Png,
}

impl std::str::FromStr for PhotoOutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(PhotoOutputFormat::Jpeg),
            "png" => Ok(PhotoOutputFormat::Png),
            other => Err(format!("unknown output format '{}' (expected jpeg or png)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera backend used for the request pipeline
    pub backend: CameraBackendType,
    /// Camera to use by id (takes precedence over `camera_index`)
    pub camera_id: Option<String>,
    /// Camera to use by position in the manager's list
    pub camera_index: Option<usize>,
    /// Stream role the configuration is generated for
    pub role: StreamRole,
    /// Requested resolution; `None` keeps the role's default (maximum) size
    pub resolution: Option<Size>,
    /// Write every frame to this exact file instead of timestamped names
    pub output_file: Option<PathBuf>,
    /// Directory for timestamped names; `None` uses the pictures directory
    pub output_dir: Option<PathBuf>,
    /// Prefix of timestamped names
    pub file_prefix: String,
    pub output_format: PhotoOutputFormat,
    /// JPEG quality preset
    pub quality: QualityPreset,
    /// How long one capture waits for its frames
    pub capture_timeout_ms: u64,
    /// Frames saved per capture
    pub min_frames: u32,
    /// JSON-lines system log
    pub log_file: PathBuf,
    /// Least severe level forwarded to the system log (error, warn, info, debug, trace)
    pub log_level: String,
    /// V4L2 device index for the simple capture path
    pub simple_device_index: usize,
    /// Output of the simple capture path
    pub simple_output: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: CameraBackendType::default(),
            camera_id: None,
            camera_index: None,
            role: StreamRole::StillCapture,
            resolution: None,
            output_file: None,
            output_dir: None,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            output_format: PhotoOutputFormat::default(),
            quality: QualityPreset::default(),
            capture_timeout_ms: DEFAULT_CAPTURE_TIMEOUT.as_millis() as u64,
            min_frames: DEFAULT_MIN_FRAMES,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            log_level: "info".to_string(),
            simple_device_index: 0,
            simple_output: PathBuf::from("image.ppm"),
        }
    }
}

impl Config {
    /// `~/.config/stillcam/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stillcam").join("config.json"))
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load `path`, or the default location, falling back to defaults when
    /// the file does not exist
    ///
    /// An explicitly given path must exist; a broken file is always an error.
    pub fn load_or_default(path: Option<&Path>) -> AppResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("serialize: {}", e)))?;
        storage::write_atomic(path, text.as_bytes())
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Reject values no session can work with
    pub fn validate(&self) -> AppResult<()> {
        if self.min_frames == 0 {
            return Err(AppError::Config("min_frames must be at least 1".to_string()));
        }
        if self.capture_timeout_ms == 0 {
            return Err(AppError::Config(
                "capture_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(size) = self.resolution
            && (size.width == 0 || size.height == 0)
        {
            return Err(AppError::Config(format!("invalid resolution {}", size)));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(AppError::Config(format!(
                "invalid log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Which camera to open
    pub fn selector(&self) -> DeviceSelector {
        match (&self.camera_id, self.camera_index) {
            (Some(id), _) => DeviceSelector::Id(id.clone()),
            (None, Some(index)) => DeviceSelector::Index(index),
            (None, None) => DeviceSelector::First,
        }
    }

    /// Where captured images go
    pub fn output_naming(&self) -> OutputNaming {
        match &self.output_file {
            Some(path) => OutputNaming::Fixed(path.clone()),
            None => OutputNaming::Timestamped {
                dir: self
                    .output_dir
                    .clone()
                    .unwrap_or_else(storage::default_photo_dir),
                prefix: self.file_prefix.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"min_frames": 3}"#).unwrap();
        assert_eq!(config.min_frames, 3);
        assert_eq!(config.file_prefix, DEFAULT_FILE_PREFIX);
        assert_eq!(config.output_format, PhotoOutputFormat::Jpeg);
    }

    #[test]
    fn test_selector_prefers_id() {
        let config = Config {
            camera_id: Some("cam".to_string()),
            camera_index: Some(2),
            ..Config::default()
        };
        assert_eq!(config.selector(), DeviceSelector::Id("cam".to_string()));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JPG".parse::<PhotoOutputFormat>(), Ok(PhotoOutputFormat::Jpeg));
        assert!("gif".parse::<PhotoOutputFormat>().is_err());
    }
}
