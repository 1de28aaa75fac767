// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use std::path::PathBuf;
use stillcam::backends::camera::{CameraBackendType, Size};
use stillcam::pipelines::photo::{DeviceSelector, EncodingFormat, SessionSettings};
use stillcam::storage::OutputNaming;
use stillcam::{AppError, Config, QualityPreset};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("stillcam-config-{}", uuid::Uuid::new_v4()))
        .join(name)
}

#[test]
fn test_config_default() {
    let config = Config::default();

    // Check sensible defaults
    assert_eq!(config.backend, CameraBackendType::Libcamera);
    assert_eq!(config.min_frames, 1);
    assert_eq!(config.quality, QualityPreset::High);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_save_and_load() {
    let path = temp_path("config.json");
    let config = Config {
        backend: CameraBackendType::Virtual,
        camera_id: Some("virtual:0".to_string()),
        resolution: Some(Size::new(1280, 720)),
        min_frames: 3,
        ..Config::default()
    };

    config.save(&path).unwrap();
    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded, config);

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_explicit_missing_file_is_an_error() {
    let path = temp_path("missing.json");
    let err = Config::load_or_default(Some(&path)).unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn test_invalid_values_are_rejected() {
    let path = temp_path("config.json");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, r#"{ "min_frames": 0 }"#).unwrap();

    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
    assert_eq!(err.exit_code(), stillcam::constants::EXIT_CONFIG_FAILURE);

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_session_settings_follow_config() {
    let config = Config {
        camera_index: Some(2),
        output_file: Some(PathBuf::from("/tmp/shot.png")),
        output_format: "png".parse().unwrap(),
        capture_timeout_ms: 750,
        ..Config::default()
    };

    let settings = SessionSettings::from_config(&config);
    assert_eq!(settings.selector, DeviceSelector::Index(2));
    assert_eq!(settings.output, OutputNaming::Fixed(PathBuf::from("/tmp/shot.png")));
    assert_eq!(settings.format, EncodingFormat::Png);
    assert_eq!(settings.timeout.as_millis(), 750);
}

#[test]
fn test_quality_presets_are_ordered() {
    let mut previous = 0u8;
    for preset in QualityPreset::ALL {
        assert!(preset.jpeg_quality() > previous);
        previous = preset.jpeg_quality();
    }
}
