// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the capture session against the virtual backend

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use stillcam::backends::camera::virtual_camera::{FaultPlan, VirtualCameraSpec, VirtualPlatform};
use stillcam::backends::camera::{ConfigurationStatus, PixelFormat};
use stillcam::pipelines::photo::{
    CaptureSession, DeviceSelector, EncodingFormat, SessionSettings, SessionState,
};
use stillcam::storage::OutputNaming;
use stillcam::CaptureError;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stillcam-session-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn small_camera(id: &str) -> VirtualCameraSpec {
    VirtualCameraSpec::new(id)
        .with_format(PixelFormat::I420, WIDTH, HEIGHT)
        .with_frame_interval(Duration::from_millis(5))
}

fn platform_with(spec: VirtualCameraSpec) -> VirtualPlatform {
    VirtualPlatform::new().with_camera(spec)
}

fn settings(dir: &Path) -> SessionSettings {
    SessionSettings {
        output: OutputNaming::timestamped(dir),
        format: EncodingFormat::Png,
        timeout: Duration::from_secs(5),
        ..SessionSettings::default()
    }
}

fn session(platform: &VirtualPlatform, dir: &Path) -> CaptureSession {
    CaptureSession::new(Box::new(platform.manager()), settings(dir))
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

#[test]
fn test_capture_saves_decodable_image() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0"));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.camera_id(), Some("cam0"));
    assert_eq!(session.buffer_count(), 4);

    let report = session.capture().unwrap();
    assert!(report.is_complete());
    assert_eq!(report.saved.len(), 1);
    assert_eq!(report.session_id, session.id());

    let image = image::open(&report.saved[0]).unwrap();
    assert_eq!((image.width(), image.height()), (WIDTH, HEIGHT));

    session.teardown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_teardown_releases_and_allows_reinitialize() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0"));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    assert!(platform.is_acquired("cam0"));

    session.teardown();
    assert!(!platform.is_acquired("cam0"));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.buffer_count(), 0);
    assert!(session.format().is_none());

    // Second teardown is a no-op
    session.teardown();

    session.initialize().unwrap();
    assert!(platform.is_acquired("cam0"));
    let report = session.capture().unwrap();
    assert_eq!(report.saved.len(), 1);

    drop(session);
    assert!(!platform.is_acquired("cam0"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_initialize_twice_is_invalid() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0"));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    let err = session.initialize().unwrap_err();
    assert!(matches!(err, CaptureError::InvalidState(_)));
    assert_eq!(session.state(), SessionState::Ready);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_capture_before_initialize_is_invalid() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0"));
    let mut session = session(&platform, &dir);

    let err = session.capture().unwrap_err();
    assert!(matches!(err, CaptureError::InvalidState(_)));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_second_session_sees_busy_camera() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0"));
    let mut first = session(&platform, &dir);
    let mut second = session(&platform, &dir);

    first.initialize().unwrap();
    let err = second.initialize().unwrap_err();
    assert_eq!(err, CaptureError::DeviceBusy("cam0".to_string()));
    assert_eq!(second.state(), SessionState::Idle);

    // The failed session must not have released the other one's lock
    assert!(platform.is_acquired("cam0"));
    first.teardown();
    second.initialize().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_empty_platform_has_no_device() {
    let dir = temp_dir();
    let platform = VirtualPlatform::new();
    let mut session = session(&platform, &dir);

    assert_eq!(session.initialize().unwrap_err(), CaptureError::NoDeviceFound);
    assert_eq!(session.state(), SessionState::Idle);
    session.teardown();
    assert_eq!(session.state(), SessionState::Idle);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_manager_start_failure() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0")).failing_manager_start();
    let mut session = session(&platform, &dir);

    let err = session.initialize().unwrap_err();
    assert!(matches!(err, CaptureError::ManagerStartFailed(_)));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_unknown_camera_id_is_not_found() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0"));
    let mut session = CaptureSession::new(
        Box::new(platform.manager()),
        SessionSettings {
            selector: DeviceSelector::Id("cam7".to_string()),
            ..settings(&dir)
        },
    );

    assert_eq!(
        session.initialize().unwrap_err(),
        CaptureError::DeviceNotFound("cam7".to_string())
    );
    assert!(!platform.is_acquired("cam0"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_selects_camera_by_index() {
    let dir = temp_dir();
    let platform = VirtualPlatform::new()
        .with_camera(small_camera("cam0"))
        .with_camera(small_camera("cam1"));
    let mut session = CaptureSession::new(
        Box::new(platform.manager()),
        SessionSettings {
            selector: DeviceSelector::Index(1),
            ..settings(&dir)
        },
    );

    session.initialize().unwrap();
    assert_eq!(session.camera_id(), Some("cam1"));
    assert!(!platform.is_acquired("cam0"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_zero_buffers_fails_initialize() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_faults(FaultPlan {
        zero_buffers: true,
        ..FaultPlan::default()
    }));
    let mut session = session(&platform, &dir);

    assert_eq!(
        session.initialize().unwrap_err(),
        CaptureError::NoBuffersAllocated
    );
    assert!(!platform.is_acquired("cam0"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_buffer_count_follows_driver() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_buffer_count(6));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    assert_eq!(session.buffer_count(), 6);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_rejected_configuration_fails_initialize() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_faults(FaultPlan {
        reject_configuration: true,
        ..FaultPlan::default()
    }));
    let mut session = session(&platform, &dir);

    let err = session.initialize().unwrap_err();
    assert!(matches!(err, CaptureError::ConfigurationRejected(_)));
    assert!(!platform.is_acquired("cam0"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_invalid_validation_still_captures() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_faults(FaultPlan {
        validation: Some(ConfigurationStatus::Invalid),
        ..FaultPlan::default()
    }));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    let report = session.capture().unwrap();
    assert_eq!(report.saved.len(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_sequential_captures_reuse_buffers() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0"));
    let mut session = CaptureSession::new(
        Box::new(platform.manager()),
        SessionSettings {
            min_frames: 2,
            ..settings(&dir)
        },
    );

    session.initialize().unwrap();
    let first = session.capture().unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    let second = session.capture().unwrap();

    assert_eq!(first.saved.len(), 2);
    assert_eq!(second.saved.len(), 2);
    assert_eq!(session.buffer_count(), 4);

    let mut all: Vec<PathBuf> = first.saved.iter().chain(&second.saved).cloned().collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 4, "every frame gets its own file");

    session.teardown();
    assert_eq!(files_in(&dir).len(), 4);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_cancelled_frames_are_never_saved() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_faults(FaultPlan {
        cancel_all: true,
        ..FaultPlan::default()
    }));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    assert_eq!(
        session.capture().unwrap_err(),
        CaptureError::AllRequestsCancelled
    );
    assert!(files_in(&dir).is_empty());
    assert_eq!(session.stats().saved, 0);
    assert!(session.stats().cancelled > 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_partial_cancellation_still_saves() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_faults(FaultPlan {
        cancel_first: 2,
        ..FaultPlan::default()
    }));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    let report = session.capture().unwrap();
    assert_eq!(report.saved.len(), 1);
    assert_eq!(session.stats().cancelled, 2);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_corrupt_frame_is_reported_and_skipped() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_faults(FaultPlan {
        corrupt_first: 1,
        ..FaultPlan::default()
    }));
    let mut session = session(&platform, &dir);

    session.initialize().unwrap();
    let report = session.capture().unwrap();
    assert_eq!(report.saved.len(), 1);
    assert!(session.stats().failed >= 1);

    let image = image::open(&report.saved[0]).unwrap();
    assert_eq!((image.width(), image.height()), (WIDTH, HEIGHT));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_slow_camera_times_out() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_frame_interval(Duration::from_secs(10)));
    let mut session = CaptureSession::new(
        Box::new(platform.manager()),
        SessionSettings {
            timeout: Duration::from_millis(200),
            ..settings(&dir)
        },
    );

    session.initialize().unwrap();
    let err = session.capture().unwrap_err();
    assert!(matches!(err, CaptureError::Timeout { failed: 0, .. }));

    session.teardown();
    assert!(!platform.is_acquired("cam0"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_abort_flag_ends_wait() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_frame_interval(Duration::from_secs(10)));
    let abort = Arc::new(AtomicBool::new(true));
    let mut session = CaptureSession::new(
        Box::new(platform.manager()),
        settings(&dir).with_abort_flag(Arc::clone(&abort)),
    );

    session.initialize().unwrap();
    assert_eq!(session.capture().unwrap_err(), CaptureError::Aborted);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_fixed_output_is_overwritten() {
    let dir = temp_dir();
    let path = dir.join("shot.jpg");
    let platform = platform_with(small_camera("cam0"));
    let mut session = CaptureSession::new(
        Box::new(platform.manager()),
        SessionSettings {
            output: OutputNaming::Fixed(path.clone()),
            format: EncodingFormat::Jpeg,
            min_frames: 2,
            ..settings(&dir)
        },
    );

    session.initialize().unwrap();
    let report = session.capture().unwrap();
    assert_eq!(report.saved, vec![path.clone(), path.clone()]);
    assert_eq!(files_in(&dir), vec![path.clone()]);

    let image = image::open(&path).unwrap();
    assert_eq!(image.width(), WIDTH);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_every_pixel_format_captures() {
    for format in [
        PixelFormat::I420,
        PixelFormat::NV12,
        PixelFormat::NV21,
        PixelFormat::YUYV,
        PixelFormat::RGB888,
        PixelFormat::BGR888,
    ] {
        let dir = temp_dir();
        let platform = platform_with(
            VirtualCameraSpec::new("cam0")
                .with_format(format, 64, 48)
                .with_frame_interval(Duration::from_millis(5)),
        );
        let mut session = session(&platform, &dir);

        session.initialize().unwrap();
        assert_eq!(session.format().unwrap().pixel_format(), format);
        let report = session.capture().unwrap();
        let image = image::open(&report.saved[0]).unwrap();
        assert_eq!((image.width(), image.height()), (64, 48), "{}", format);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

/// Session over a faulty `cam0` that never leaves files behind
fn faulty_session(faults: FaultPlan, dir: &Path) -> (VirtualPlatform, CaptureSession) {
    let platform = platform_with(small_camera("cam0").with_faults(faults));
    let session = session(&platform, dir);
    (platform, session)
}

fn assert_clean_teardown(platform: &VirtualPlatform, mut session: CaptureSession, dir: &Path) {
    assert!(files_in(dir).is_empty());
    session.teardown();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!platform.is_acquired("cam0"));
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_allocation_failure_fails_initialize() {
    let dir = temp_dir();
    let (platform, mut session) = faulty_session(
        FaultPlan {
            fail_allocation: true,
            ..FaultPlan::default()
        },
        &dir,
    );

    let err = session.initialize().unwrap_err();
    assert!(matches!(err, CaptureError::AllocationFailed(_)), "{:?}", err);
    assert!(!platform.is_acquired("cam0"));
    assert_clean_teardown(&platform, session, &dir);
}

#[test]
fn test_missing_configuration_fails_initialize() {
    let dir = temp_dir();
    let (platform, mut session) = faulty_session(
        FaultPlan {
            no_configuration: true,
            ..FaultPlan::default()
        },
        &dir,
    );

    let err = session.initialize().unwrap_err();
    assert!(matches!(err, CaptureError::ConfigurationUnavailable(_)), "{:?}", err);
    assert!(!platform.is_acquired("cam0"));
    assert_clean_teardown(&platform, session, &dir);
}

#[test]
fn test_request_creation_failure_fails_capture() {
    let dir = temp_dir();
    let (platform, mut session) = faulty_session(
        FaultPlan {
            fail_request_creation_after: Some(2),
            ..FaultPlan::default()
        },
        &dir,
    );

    session.initialize().unwrap();
    let err = session.capture().unwrap_err();
    assert!(matches!(err, CaptureError::RequestCreationFailed(_)), "{:?}", err);
    assert_eq!(session.state(), SessionState::Ready);
    assert_clean_teardown(&platform, session, &dir);
}

#[test]
fn test_buffer_binding_failure_fails_capture() {
    let dir = temp_dir();
    let (platform, mut session) = faulty_session(
        FaultPlan {
            fail_buffer_binding: true,
            ..FaultPlan::default()
        },
        &dir,
    );

    session.initialize().unwrap();
    let err = session.capture().unwrap_err();
    assert!(matches!(err, CaptureError::BufferBindingFailed(_)), "{:?}", err);
    assert_eq!(session.state(), SessionState::Ready);
    assert_clean_teardown(&platform, session, &dir);
}

#[test]
fn test_start_failure_fails_capture() {
    let dir = temp_dir();
    let (platform, mut session) = faulty_session(
        FaultPlan {
            fail_start: true,
            ..FaultPlan::default()
        },
        &dir,
    );

    session.initialize().unwrap();
    let err = session.capture().unwrap_err();
    assert!(matches!(err, CaptureError::StartFailed(_)), "{:?}", err);
    assert_eq!(session.state(), SessionState::Ready);
    assert_clean_teardown(&platform, session, &dir);
}

#[test]
fn test_partial_submit_stops_the_camera() {
    let dir = temp_dir();
    let (platform, mut session) = faulty_session(
        FaultPlan {
            fail_queue_after: Some(2),
            ..FaultPlan::default()
        },
        &dir,
    );

    session.initialize().unwrap();
    let err = session.capture().unwrap_err();
    assert!(matches!(err, CaptureError::QueueFailed(_)), "{:?}", err);
    assert_eq!(session.state(), SessionState::Ready);

    // The two requests that made it in are cancelled, not completed later
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(session.stats().saved, 0);
    assert_eq!(session.stats().cancelled, 2);

    let err = session.capture().unwrap_err();
    assert!(matches!(err, CaptureError::QueueFailed(_)), "{:?}", err);
    assert_clean_teardown(&platform, session, &dir);
}

#[test]
fn test_planeless_buffers_fail_every_frame() {
    let dir = temp_dir();
    let platform = platform_with(small_camera("cam0").with_faults(FaultPlan {
        planeless_buffers: true,
        ..FaultPlan::default()
    }));
    let mut session = CaptureSession::new(
        Box::new(platform.manager()),
        SessionSettings {
            timeout: Duration::from_millis(300),
            ..settings(&dir)
        },
    );

    session.initialize().unwrap();
    let err = session.capture().unwrap_err();
    match err {
        CaptureError::Timeout { failed, .. } => assert!(failed > 0),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(session.stats().failed > 0);
    assert_eq!(session.stats().saved, 0);
    assert_clean_teardown(&platform, session, &dir);
}
