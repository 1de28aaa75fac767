// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Listing available cameras
//! - Taking photos through the capture session
//! - The simple V4L2 → PPM capture
//! - Showing and initializing the configuration

use crate::PhotoArgs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use stillcam::Config;
use stillcam::backends::camera::{CameraBackendType, available_backends, create_manager};
use stillcam::errors::{AppError, AppResult};
use stillcam::pipelines::photo::{CaptureSession, DeviceEnumerator, SessionSettings};
use stillcam::pipelines::simple::SimpleCapture;
use tracing::{info, warn};

/// Configuration file, defaults when there is none
pub fn load_config(path: Option<&Path>) -> AppResult<Config> {
    Config::load_or_default(path)
}

/// List all cameras of a backend
pub fn list_cameras(config: &Config, backend: Option<CameraBackendType>) -> AppResult<()> {
    let backend = backend.unwrap_or(config.backend);
    let mut enumerator = DeviceEnumerator::new(create_manager(backend)?);
    enumerator.start()?;

    let result = enumerator.list_devices();
    enumerator.stop();

    match result {
        Ok(ids) => {
            println!("Available cameras ({}):", backend);
            println!();
            for (index, id) in ids.iter().enumerate() {
                println!("  [{}] {}", index, id);
            }
            Ok(())
        }
        Err(stillcam::CaptureError::NoDeviceFound) => {
            println!("No cameras found.");
            let compiled: Vec<String> = available_backends().iter().map(|b| b.to_string()).collect();
            println!("Backends in this build: {}", compiled.join(", "));
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Apply `photo` options on top of the configuration
fn apply_photo_args(config: &mut Config, args: &PhotoArgs) {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(camera) = &args.camera {
        match camera.parse::<usize>() {
            Ok(index) => {
                config.camera_index = Some(index);
                config.camera_id = None;
            }
            Err(_) => config.camera_id = Some(camera.clone()),
        }
    }
    if let Some(output) = &args.output {
        config.output_file = Some(output.clone());
    }
    if let Some(dir) = &args.dir {
        config.output_dir = Some(dir.clone());
        config.output_file = None;
    }
    if let Some(format) = args.format {
        config.output_format = format;
    }
    if let Some(quality) = args.quality {
        config.quality = quality;
    }
    if let Some(role) = args.role {
        config.role = role;
    }
    if let Some(resolution) = args.resolution {
        config.resolution = Some(resolution);
    }
    if let Some(frames) = args.frames {
        config.min_frames = frames;
    }
    if let Some(timeout) = args.timeout {
        config.capture_timeout_ms = timeout;
    }
}

/// Take photos with the request pipeline
pub fn take_photo(mut config: Config, args: &PhotoArgs) -> AppResult<()> {
    apply_photo_args(&mut config, args);
    config.validate()?;

    // Set up Ctrl+C handler
    let abort = Arc::new(AtomicBool::new(false));
    let abort_clone = Arc::clone(&abort);
    ctrlc::set_handler(move || {
        abort_clone.store(true, Ordering::SeqCst);
    })
    .map_err(|e| AppError::Other(format!("Failed to install Ctrl+C handler: {}", e)))?;

    let settings = SessionSettings::from_config(&config).with_abort_flag(Arc::clone(&abort));
    let mut session = CaptureSession::new(create_manager(config.backend)?, settings);
    session.initialize()?;

    if let (Some(camera), Some(format)) = (session.camera_id(), session.format()) {
        println!("Using camera: {}", camera);
        println!("Capture format: {}", format);
    }

    let repeat = args.repeat.max(1);
    let mut saved: Vec<PathBuf> = Vec::new();
    for round in 1..=repeat {
        if repeat > 1 {
            println!("Capture {}/{}...", round, repeat);
        } else {
            println!("Capturing...");
        }
        let report = session.capture()?;
        if report.failed > 0 {
            warn!(failed = report.failed, "Some frames could not be saved");
        }
        for path in &report.saved {
            println!("Photo saved: {}", path.display());
        }
        saved.extend(report.saved);
    }

    let stats = session.stats();
    session.teardown();
    info!(
        saved = saved.len(),
        completed = stats.completed,
        failed = stats.failed,
        "Capture finished"
    );
    Ok(())
}

/// Grab one frame from a V4L2 node and write it as PPM
pub fn simple_photo(
    config: &Config,
    device: Option<usize>,
    output: Option<PathBuf>,
) -> AppResult<()> {
    let index = device.unwrap_or(config.simple_device_index);
    let output = output.unwrap_or_else(|| config.simple_output.clone());

    let mut capture = SimpleCapture::new(index);
    capture.open()?;
    let result = capture.grab().and_then(|()| capture.write(&output));
    capture.close();
    result?;

    println!("Image saved to: {}", output.display());
    Ok(())
}

/// Print the effective configuration, optionally writing it out
pub fn show_config(config: &Config, path: Option<&Path>, init: bool) -> AppResult<()> {
    let text = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Config(format!("serialize: {}", e)))?;
    println!("{}", text);

    if init {
        let path = path
            .map(Path::to_path_buf)
            .or_else(Config::default_path)
            .ok_or_else(|| AppError::Config("no configuration directory".to_string()))?;
        config.save(&path)?;
        println!();
        println!("Configuration written to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_camera_is_an_index() {
        let mut config = Config::default();
        let args = PhotoArgs {
            camera: Some("1".to_string()),
            ..PhotoArgs::default()
        };
        apply_photo_args(&mut config, &args);
        assert_eq!(config.camera_index, Some(1));
        assert_eq!(config.camera_id, None);
    }

    #[test]
    fn test_named_camera_is_an_id() {
        let mut config = Config::default();
        let args = PhotoArgs {
            camera: Some("/base/soc/i2c0mux/i2c@1/imx708@1a".to_string()),
            frames: Some(3),
            ..PhotoArgs::default()
        };
        apply_photo_args(&mut config, &args);
        assert_eq!(
            config.camera_id.as_deref(),
            Some("/base/soc/i2c0mux/i2c@1/imx708@1a")
        );
        assert_eq!(config.min_frames, 3);
    }

    #[test]
    fn test_dir_clears_fixed_output() {
        let mut config = Config {
            output_file: Some(PathBuf::from("shot.jpg")),
            ..Config::default()
        };
        let args = PhotoArgs {
            dir: Some(PathBuf::from("/tmp/shots")),
            ..PhotoArgs::default()
        };
        apply_photo_args(&mut config, &args);
        assert_eq!(config.output_file, None);
        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/shots")));
    }
}
