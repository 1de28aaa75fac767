// SPDX-License-Identifier: GPL-3.0-only

//! Native libcamera backend using libcamera-rs bindings
//!
//! # Architecture
//!
//! All libcamera objects (CameraManager, Camera, ActiveCamera, FrameBuffers,
//! Requests) live on a dedicated camera thread. This avoids Send issues with
//! libcamera's raw pointers and keeps the whole camera lifecycle on one thread.
//!
//! ```text
//! ┌──────────────────────┐         ┌───────────────────────┐
//! │  LibcameraManager    │ Command │   Camera Thread       │
//! │  LibcameraDevice  ───┼────────►│                       │
//! │                      │◄────────┤  CameraManager        │
//! │                      │  reply  │  ActiveCamera         │
//! │  LibcameraQueue   ───┼────────►│  FrameBuffers         │
//! │  (any thread)        │  Queue  │  Requests             │
//! └──────────────────────┘         │  completion callback  │
//!                                  └───────────────────────┘
//! ```
//!
//! libcamera allows a single CameraManager per process, so only one
//! [`LibcameraManager`] can be running at a time, and it holds at most one
//! acquired camera.

mod camera_thread;
mod pixel_formats;

use crate::backends::camera::types::*;
use crate::backends::camera::{CameraDevice, CameraManager, RequestQueue};
use crate::errors::{CaptureError, CaptureResult};
use camera_thread::{Command, Reply, camera_thread_main, claim_manager, release_manager};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Send a command and wait for the camera thread's answer
fn call<T>(
    commands: &Sender<Command>,
    command: impl FnOnce(Reply<T>) -> Command,
) -> CaptureResult<T> {
    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
    commands
        .send(command(reply_tx))
        .map_err(|_| CaptureError::InvalidState("libcamera thread is gone".to_string()))?;
    reply_rx
        .recv()
        .map_err(|_| CaptureError::InvalidState("libcamera thread dropped the reply".to_string()))?
}

/// libcamera camera manager
pub struct LibcameraManager {
    commands: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl LibcameraManager {
    pub fn new() -> Self {
        Self {
            commands: None,
            thread: None,
        }
    }

    fn commands(&self) -> CaptureResult<&Sender<Command>> {
        self.commands.as_ref().ok_or_else(|| {
            CaptureError::InvalidState("camera manager not started".to_string())
        })
    }
}

impl Default for LibcameraManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraManager for LibcameraManager {
    fn start(&mut self) -> CaptureResult<()> {
        if self.commands.is_some() {
            return Ok(());
        }
        if !claim_manager() {
            return Err(CaptureError::ManagerStartFailed(
                "another libcamera manager is running in this process".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel();
        // Channel for thread to report initialization result
        let (init_tx, init_rx) = mpsc::sync_channel::<CaptureResult<String>>(1);

        let thread = match std::thread::Builder::new()
            .name("libcamera-manager".to_string())
            .spawn(move || {
                camera_thread_main(rx, init_tx);
                release_manager();
            }) {
            Ok(thread) => thread,
            Err(e) => {
                release_manager();
                return Err(CaptureError::ManagerStartFailed(format!(
                    "spawn camera thread: {}",
                    e
                )));
            }
        };

        let version = match init_rx.recv() {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CaptureError::ManagerStartFailed(
                    "camera thread died during initialization".to_string(),
                ));
            }
        };

        info!(version = %version, "libcamera camera manager started");
        self.commands = Some(tx);
        self.thread = Some(thread);
        Ok(())
    }

    fn camera_ids(&self) -> CaptureResult<Vec<String>> {
        call(self.commands()?, Command::ListCameras)
    }

    fn acquire(&mut self, id: &str) -> CaptureResult<Box<dyn CameraDevice>> {
        let commands = self.commands()?.clone();
        call(&commands, |reply| Command::Acquire(id.to_string(), reply))?;
        Ok(Box::new(LibcameraDevice::new(id.to_string(), commands)))
    }

    fn stop(&mut self) {
        let Some(commands) = self.commands.take() else {
            return;
        };
        let _ = commands.send(Command::Shutdown);
        drop(commands);

        if let Some(thread) = self.thread.take()
            && let Err(e) = thread.join()
        {
            error!("libcamera thread panicked: {:?}", e);
        }
        info!("libcamera camera manager stopped");
    }

    fn is_running(&self) -> bool {
        self.commands.is_some()
    }
}

impl Drop for LibcameraManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Queue handle; requests travel to the camera thread without waiting
struct LibcameraQueue {
    camera_id: String,
    commands: Sender<Command>,
    streaming: Arc<AtomicBool>,
}

impl RequestQueue for LibcameraQueue {
    fn queue(&self, mut request: Request) -> CaptureResult<()> {
        if !request.is_queueable() {
            return Err(CaptureError::QueueFailed(format!(
                "request {} is {} and cannot be queued",
                request.cookie(),
                request.status()
            )));
        }
        if !self.streaming.load(Ordering::Acquire) {
            return Err(CaptureError::QueueFailed(format!(
                "camera {} is not streaming",
                self.camera_id
            )));
        }
        request.mark_queued();
        self.commands
            .send(Command::Queue(request))
            .map_err(|_| CaptureError::QueueFailed("libcamera thread is gone".to_string()))
    }
}

/// An acquired libcamera camera
pub struct LibcameraDevice {
    id: String,
    commands: Sender<Command>,
    streaming: Arc<AtomicBool>,
    queue: Arc<LibcameraQueue>,
    configured: bool,
    buffers: Vec<Arc<FrameBuffer>>,
    released: bool,
}

impl LibcameraDevice {
    fn new(id: String, commands: Sender<Command>) -> Self {
        let streaming = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(LibcameraQueue {
            camera_id: id.clone(),
            commands: commands.clone(),
            streaming: Arc::clone(&streaming),
        });
        Self {
            id,
            commands,
            streaming,
            queue,
            configured: false,
            buffers: Vec::new(),
            released: false,
        }
    }

    fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.streaming.store(false, Ordering::Release);
        self.buffers.clear();
        if let Err(e) = call(&self.commands, Command::Release) {
            warn!(camera = %self.id, error = %e, "Failed to release camera");
        }
    }
}

impl CameraDevice for LibcameraDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_request_completed(&mut self, callback: CompletionCallback) {
        if self.commands.send(Command::SetCallback(callback)).is_err() {
            warn!(camera = %self.id, "libcamera thread is gone, callback dropped");
        }
    }

    fn generate_configuration(&mut self, role: StreamRole) -> CaptureResult<StreamConfiguration> {
        call(&self.commands, |reply| {
            Command::GenerateConfiguration(role, reply)
        })
    }

    fn validate(&mut self, config: &mut StreamConfiguration) -> ConfigurationStatus {
        match call(&self.commands, |reply| Command::Validate(config.clone(), reply)) {
            Ok((adjusted, status)) => {
                *config = adjusted;
                status
            }
            Err(e) => {
                warn!(camera = %self.id, error = %e, "Validation failed");
                ConfigurationStatus::Invalid
            }
        }
    }

    fn configure(&mut self, config: &StreamConfiguration) -> CaptureResult<StreamFormat> {
        let format = call(&self.commands, |reply| {
            Command::Configure(config.clone(), reply)
        })?;
        self.configured = true;
        Ok(format)
    }

    fn allocate_buffers(&mut self) -> CaptureResult<Vec<Arc<FrameBuffer>>> {
        if !self.configured {
            return Err(CaptureError::AllocationFailed(format!(
                "camera {} is not configured",
                self.id
            )));
        }
        let buffers = call(&self.commands, Command::Allocate)?;
        self.buffers = buffers.clone();
        Ok(buffers)
    }

    fn free_buffers(&mut self) -> CaptureResult<()> {
        call(&self.commands, Command::Free)?;
        self.buffers.clear();
        Ok(())
    }

    fn create_request(&mut self, cookie: u64) -> CaptureResult<Request> {
        call(&self.commands, |reply| Command::CreateRequest(cookie, reply))?;
        Ok(Request::new(cookie))
    }

    fn attach_buffer(
        &mut self,
        request: &mut Request,
        buffer: &Arc<FrameBuffer>,
    ) -> CaptureResult<()> {
        if !self.buffers.iter().any(|own| Arc::ptr_eq(own, buffer)) {
            return Err(CaptureError::BufferBindingFailed(format!(
                "buffer {} was not allocated for the current stream",
                buffer.index()
            )));
        }
        let cookie = request.cookie();
        call(&self.commands, |reply| Command::AttachBuffer {
            cookie,
            index: buffer.index(),
            allocation: buffer.allocation(),
            reply,
        })?;
        request.add_buffer(Arc::clone(buffer))
    }

    fn start(&mut self) -> CaptureResult<()> {
        if self.is_streaming() {
            return Err(CaptureError::InvalidState(format!(
                "camera {} is already streaming",
                self.id
            )));
        }
        call(&self.commands, Command::Start)?;
        self.streaming.store(true, Ordering::Release);
        Ok(())
    }

    fn request_queue(&self) -> Arc<dyn RequestQueue> {
        self.queue.clone()
    }

    fn stop(&mut self) -> CaptureResult<()> {
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        call(&self.commands, Command::Stop)
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn release(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for LibcameraDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
