// SPDX-License-Identifier: GPL-3.0-only

//! Capture session: initialize → capture → teardown
//!
//! The session owns every resource of one camera: the manager (through the
//! enumerator), the acquired device, the buffer pool and the completion
//! dispatch. Teardown releases them in strict reverse order and runs on drop,
//! so early returns never leak an acquired camera.

use super::buffer_pool::BufferPool;
use super::completion::{
    CaptureShared, CompletionDispatch, CompletionHandler, CompletionStats, FrameOutcome,
};
use super::encoding::{EncodingFormat, PhotoEncoder};
use super::enumeration::{DeviceEnumerator, DeviceSelector};
use super::negotiation::ConfigurationNegotiator;
use super::scheduler::RequestScheduler;
use crate::backends::camera::types::{Size, StreamFormat, StreamRole};
use crate::backends::camera::{CameraDevice, CameraManager};
use crate::config::Config;
use crate::constants::{CAPTURE_POLL_INTERVAL, OUTCOME_CHANNEL_CAPACITY, QualityPreset};
use crate::errors::{CaptureError, CaptureResult};
use crate::storage::{OutputNaming, OutputSequence};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything a session needs to know up front
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub selector: DeviceSelector,
    pub role: StreamRole,
    /// Overrides the role's default size when set
    pub resolution: Option<Size>,
    pub output: OutputNaming,
    pub format: EncodingFormat,
    pub quality: QualityPreset,
    /// Images saved per `capture()` call
    pub min_frames: u32,
    /// Upper bound of one `capture()` wait
    pub timeout: Duration,
    /// Set from outside (Ctrl-C) to end a capture wait early
    pub abort: Option<Arc<AtomicBool>>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            selector: config.selector(),
            role: config.role,
            resolution: config.resolution,
            output: config.output_naming(),
            format: config.output_format.into(),
            quality: config.quality,
            min_frames: config.min_frames.max(1),
            timeout: config.capture_timeout(),
            abort: None,
        }
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing acquired
    Idle,
    /// Device acquired, configured and buffers allocated
    Ready,
    /// Requests circulating
    Streaming,
}

/// Result of one successful `capture()` call
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub session_id: Uuid,
    /// Files written by this call, in completion order
    pub saved: Vec<PathBuf>,
    /// Frames that failed to decode or persist during the wait
    pub failed: u64,
    /// Requests that came back cancelled (or could not be requeued)
    pub cancelled: u64,
    pub requested: u64,
    pub elapsed: Duration,
}

impl CaptureReport {
    pub fn is_complete(&self) -> bool {
        self.saved.len() as u64 >= self.requested
    }
}

pub struct CaptureSession {
    id: Uuid,
    settings: SessionSettings,
    state: SessionState,
    enumerator: DeviceEnumerator,
    negotiator: ConfigurationNegotiator,
    pool: BufferPool,
    scheduler: RequestScheduler,
    device: Option<Box<dyn CameraDevice>>,
    format: Option<StreamFormat>,
    dispatch: Arc<CompletionDispatch>,
    shared: Arc<CaptureShared>,
    output: Arc<OutputSequence>,
    outcome_tx: SyncSender<FrameOutcome>,
    outcome_rx: Receiver<FrameOutcome>,
}

impl CaptureSession {
    pub fn new(manager: Box<dyn CameraManager>, settings: SessionSettings) -> Self {
        let (outcome_tx, outcome_rx) = sync_channel(OUTCOME_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        debug!(session = %id, selector = %settings.selector, "Capture session created");
        Self {
            id,
            negotiator: ConfigurationNegotiator::new(settings.resolution),
            output: Arc::new(OutputSequence::new(settings.output.clone())),
            settings,
            state: SessionState::Idle,
            enumerator: DeviceEnumerator::new(manager),
            pool: BufferPool::new(),
            scheduler: RequestScheduler::new(),
            device: None,
            format: None,
            dispatch: CompletionDispatch::new(),
            shared: Arc::new(CaptureShared::default()),
            outcome_tx,
            outcome_rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated format, once initialized
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    pub fn camera_id(&self) -> Option<&str> {
        self.device.as_ref().map(|device| device.id())
    }

    /// Totals of the completion path since the session was created
    pub fn stats(&self) -> CompletionStats {
        self.shared.stats()
    }

    /// Start the manager, acquire and configure a camera, allocate buffers
    ///
    /// Short-circuits on the first failure; whatever was brought up is torn
    /// down again before the error is returned.
    pub fn initialize(&mut self) -> CaptureResult<()> {
        if self.state != SessionState::Idle {
            return Err(CaptureError::InvalidState(
                "session is already initialized".to_string(),
            ));
        }

        match self.bring_up() {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!(
                    session = %self.id,
                    camera = self.camera_id().unwrap_or_default(),
                    buffers = self.pool.len(),
                    "Capture session ready"
                );
                Ok(())
            }
            Err(e) => {
                error!(session = %self.id, error = %e, "Failed to initialize capture session");
                self.teardown();
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> CaptureResult<()> {
        self.enumerator.start()?;
        let ids = self.enumerator.list_devices()?;
        let id = DeviceEnumerator::select(&ids, &self.settings.selector)?;

        let device = self.enumerator.acquire(&id, self.dispatch.callback())?;
        let device = self.device.insert(device);

        let format = self
            .negotiator
            .configure(device.as_mut(), self.settings.role)?;
        self.pool.allocate(device.as_mut(), &format)?;
        self.format = Some(format);
        Ok(())
    }

    /// Save `min_frames` new images
    ///
    /// The first call builds, starts and submits the requests; later calls
    /// only arm new frames. Blocks until the frames are saved, the timeout
    /// elapses or the abort flag is set. Succeeds when at least one image
    /// was saved.
    pub fn capture(&mut self) -> CaptureResult<CaptureReport> {
        let started = Instant::now();
        let requested = u64::from(self.settings.min_frames.max(1));

        // Reports of frames that finished after the previous wait ended
        while self.outcome_rx.try_recv().is_ok() {}

        match self.state {
            SessionState::Idle => {
                return Err(CaptureError::InvalidState(
                    "session is not initialized".to_string(),
                ));
            }
            SessionState::Ready => self.start_streaming(requested)?,
            SessionState::Streaming => {
                if self.shared.in_flight() == 0 {
                    return Err(CaptureError::AllRequestsCancelled);
                }
                self.shared.arm(requested);
            }
        }
        debug!(session = %self.id, requested, "Waiting for frames");

        let deadline = started + self.settings.timeout;
        let mut saved = Vec::new();
        let mut failed = 0u64;
        let mut cancelled = 0u64;

        let result = loop {
            if saved.len() as u64 >= requested {
                break Ok(());
            }
            if self.aborted() {
                break Err(CaptureError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(CaptureError::Timeout {
                    waited: now - started,
                    failed,
                });
            }

            match self
                .outcome_rx
                .recv_timeout((deadline - now).min(CAPTURE_POLL_INTERVAL))
            {
                Ok(FrameOutcome::Saved { path, sequence, .. }) => {
                    info!(session = %self.id, sequence, path = %path.display(), "Photo saved");
                    saved.push(path);
                }
                Ok(FrameOutcome::Failed { .. }) => failed += 1,
                Ok(FrameOutcome::Cancelled { .. }) | Ok(FrameOutcome::Lost { .. }) => {
                    cancelled += 1
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.in_flight() == 0 {
                        break Err(CaptureError::AllRequestsCancelled);
                    }
                }
                // The session keeps a sender, so this only happens if the
                // channel was replaced underneath us
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(CaptureError::InvalidState(
                        "completion channel closed".to_string(),
                    ));
                }
            }
        };
        self.shared.disarm();

        let report = CaptureReport {
            session_id: self.id,
            saved,
            failed,
            cancelled,
            requested,
            elapsed: started.elapsed(),
        };

        match result {
            Ok(()) => Ok(report),
            Err(e) if report.saved.is_empty() => {
                warn!(session = %self.id, error = %e, failed, cancelled, "Capture produced no image");
                Err(e)
            }
            Err(e) => {
                warn!(
                    session = %self.id,
                    saved = report.saved.len(),
                    requested,
                    error = %e,
                    "Capture finished with fewer images than requested"
                );
                Ok(report)
            }
        }
    }

    /// Install the handler, build and submit every request
    fn start_streaming(&mut self, requested: u64) -> CaptureResult<()> {
        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::InvalidState("no device acquired".to_string()));
        };
        let Some(format) = self.format else {
            return Err(CaptureError::InvalidState("no format negotiated".to_string()));
        };

        let mut encoder = PhotoEncoder::new();
        encoder.set_format(self.settings.format);
        encoder.set_quality(self.settings.quality);
        self.dispatch.install(CompletionHandler::new(
            self.id,
            format,
            encoder,
            Arc::clone(&self.output),
            device.request_queue(),
            Arc::clone(&self.shared),
            self.outcome_tx.clone(),
        ));

        self.scheduler.build_requests(device.as_mut(), &self.pool)?;
        self.scheduler.start(device.as_mut())?;

        // Completions may arrive before submit returns
        self.shared.arm(requested);
        let queue = device.request_queue();
        if let Err(e) = self
            .scheduler
            .submit(queue.as_ref(), self.shared.in_flight_counter())
        {
            // Requests already queued come back cancelled
            self.shared.disarm();
            if let Err(stop_err) = device.stop() {
                warn!(session = %self.id, error = %stop_err, "Failed to stop camera");
            }
            self.shared.reset_in_flight();
            self.scheduler.clear();
            return Err(e);
        }

        self.state = SessionState::Streaming;
        Ok(())
    }

    fn aborted(&self) -> bool {
        self.settings
            .abort
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Stop streaming, free buffers, release the camera, stop the manager
    ///
    /// Safe in every state and idempotent. Afterwards the session can be
    /// initialized again.
    pub fn teardown(&mut self) {
        let was_active = self.device.is_some() || self.enumerator.is_running();

        if let Some(device) = self.device.as_mut()
            && device.is_streaming()
            && let Err(e) = device.stop()
        {
            warn!(session = %self.id, error = %e, "Failed to stop camera");
        }
        self.shared.disarm();
        self.shared.reset_in_flight();
        self.scheduler.clear();

        if let Some(device) = self.device.as_mut()
            && let Err(e) = self.pool.free(device.as_mut())
        {
            warn!(session = %self.id, error = %e, "Failed to free frame buffers");
        }
        // Anything the driver did not take back goes with the device
        self.pool = BufferPool::new();
        self.dispatch.clear();

        if let Some(device) = self.device.take() {
            let id = device.id().to_string();
            device.release();
            info!(session = %self.id, camera = %id, "Camera released");
        }
        self.enumerator.stop();

        self.format = None;
        self.state = SessionState::Idle;
        if was_active {
            debug!(session = %self.id, "Capture session torn down");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
