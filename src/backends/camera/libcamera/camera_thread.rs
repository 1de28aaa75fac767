// SPDX-License-Identifier: GPL-3.0-only

//! Camera thread, owns all libcamera objects.
//!
//! The CameraManager, the acquired camera, its configuration, allocator and
//! requests form a borrow chain, and none of them are Send. They are created,
//! used and dropped on this one thread; the rest of the crate talks to it with
//! [`Command`]s.
//!
//! Completed libcamera requests are translated into the crate's [`Request`]
//! and handed to the registered callback on this thread.

use super::pixel_formats::{format_name, from_libcamera, stream_role, to_libcamera};
use crate::backends::camera::types::{
    CompletionCallback, ConfigurationStatus, FrameBuffer, FrameMetadata, PixelFormat, Plane,
    Request, Size, StreamConfiguration, StreamFormat, StreamRole,
};
use crate::errors::{CaptureError, CaptureResult};
use libcamera::camera::{ActiveCamera, Camera, CameraConfiguration, CameraConfigurationStatus};
use libcamera::camera_manager::CameraManager;
use libcamera::framebuffer::AsFrameBuffer;
use libcamera::framebuffer_allocator::{FrameBuffer as LcFrameBuffer, FrameBufferAllocator};
use libcamera::request::{Request as LcRequest, RequestStatus as LcRequestStatus, ReuseFlag};
use libcamera::stream::Stream;
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the thread waits for a completion before looking at commands again
const COMPLETION_POLL: Duration = Duration::from_millis(2);

pub(super) type Reply<T> = SyncSender<CaptureResult<T>>;

pub(super) enum Command {
    ListCameras(Reply<Vec<String>>),
    Acquire(String, Reply<()>),
    SetCallback(CompletionCallback),
    GenerateConfiguration(StreamRole, Reply<StreamConfiguration>),
    Validate(
        StreamConfiguration,
        Reply<(StreamConfiguration, ConfigurationStatus)>,
    ),
    Configure(StreamConfiguration, Reply<StreamFormat>),
    Allocate(Reply<Vec<Arc<FrameBuffer>>>),
    Free(Reply<()>),
    CreateRequest(u64, Reply<()>),
    AttachBuffer {
        cookie: u64,
        index: usize,
        allocation: u64,
        reply: Reply<()>,
    },
    Start(Reply<()>),
    /// Fire-and-forget; failures come back as cancelled completions
    Queue(Request),
    Stop(Reply<()>),
    Release(Reply<()>),
    Shutdown,
}

impl Command {
    /// Answer a command that makes no sense in the current state
    fn reject(self, error: CaptureError) {
        match self {
            Command::ListCameras(reply) => {
                let _ = reply.send(Err(error));
            }
            Command::GenerateConfiguration(_, reply) => {
                let _ = reply.send(Err(error));
            }
            Command::Validate(_, reply) => {
                let _ = reply.send(Err(error));
            }
            Command::Configure(_, reply) => {
                let _ = reply.send(Err(error));
            }
            Command::Allocate(reply) => {
                let _ = reply.send(Err(error));
            }
            Command::Acquire(_, reply)
            | Command::Free(reply)
            | Command::CreateRequest(_, reply)
            | Command::AttachBuffer { reply, .. }
            | Command::Start(reply)
            | Command::Stop(reply)
            | Command::Release(reply) => {
                let _ = reply.send(Err(error));
            }
            Command::SetCallback(_) | Command::Queue(_) | Command::Shutdown => {}
        }
    }
}

/// Main entry point for the camera thread
///
/// Reports whether the CameraManager came up via `init_tx`, then serves
/// commands until `Shutdown` or until every sender is gone.
pub(super) fn camera_thread_main(
    commands: Receiver<Command>,
    init_tx: SyncSender<CaptureResult<String>>,
) {
    let mgr = match CameraManager::new() {
        Ok(mgr) => mgr,
        Err(e) => {
            let _ = init_tx.send(Err(CaptureError::ManagerStartFailed(format!(
                "CameraManager::new: {}",
                e
            ))));
            return;
        }
    };
    let version = mgr.version().to_string();
    info!(version = %version, "libcamera version");
    if init_tx.send(Ok(version)).is_err() {
        return;
    }

    serve_manager(&mgr, &commands);

    // mgr drops last, after every object of the camera session is gone
    info!("CameraManager released");
}

fn camera_ids(mgr: &CameraManager) -> Vec<String> {
    mgr.cameras().iter().map(|cam| cam.id().to_string()).collect()
}

fn serve_manager(mgr: &CameraManager, commands: &Receiver<Command>) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::ListCameras(reply) => {
                let _ = reply.send(Ok(camera_ids(mgr)));
            }
            Command::Acquire(id, reply) => {
                let Some(cam) = mgr.get(&id) else {
                    let _ = reply.send(Err(CaptureError::DeviceNotFound(id)));
                    continue;
                };
                let active = match cam.acquire() {
                    Ok(active) => active,
                    Err(e) => {
                        let _ = reply.send(Err(CaptureError::DeviceBusy(format!("{}: {}", id, e))));
                        continue;
                    }
                };
                info!(camera = %id, "Camera acquired");
                let _ = reply.send(Ok(()));

                let mut session = CameraSession::new(&cam, active, id);
                let flow = session.serve(mgr, commands);
                session.shutdown();
                drop(session);
                drop(cam);
                if flow == Flow::Shutdown {
                    return;
                }
            }
            Command::Shutdown => return,
            Command::SetCallback(_) | Command::Queue(_) => {
                debug!("Camera command without an acquired camera ignored");
            }
            other => other.reject(CaptureError::InvalidState("no camera acquired".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Released,
    Shutdown,
}

/// Everything belonging to the acquired camera
struct CameraSession<'a> {
    cam: &'a Camera<'a>,
    active: ActiveCamera<'a>,
    id: String,
    completions: Receiver<LcRequest>,
    callback: Option<CompletionCallback>,
    config: Option<CameraConfiguration>,
    role: StreamRole,
    stream: Option<Stream>,
    /// Kept alive while its buffers are in use
    _allocator: Option<FrameBufferAllocator>,
    /// Allocated buffers not yet attached to a request, by buffer index
    unattached: Vec<Option<LcFrameBuffer>>,
    allocation: u64,
    /// libcamera requests not owned by the camera, by cookie
    idle: HashMap<u64, LcRequest>,
    /// Our side of every request the camera owns, by cookie
    queued: HashMap<u64, Request>,
    streaming: bool,
}

impl<'a> CameraSession<'a> {
    fn new(cam: &'a Camera<'a>, mut active: ActiveCamera<'a>, id: String) -> Self {
        let completions = active.subscribe_request_completed();
        Self {
            cam,
            active,
            id,
            completions,
            callback: None,
            config: None,
            role: StreamRole::StillCapture,
            stream: None,
            _allocator: None,
            unattached: Vec::new(),
            allocation: 0,
            idle: HashMap::new(),
            queued: HashMap::new(),
            streaming: false,
        }
    }

    fn serve(&mut self, mgr: &CameraManager, commands: &Receiver<Command>) -> Flow {
        loop {
            let command = if self.streaming {
                match self.completions.recv_timeout(COMPLETION_POLL) {
                    Ok(request) => self.complete(request),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        error!(camera = %self.id, "Completion channel disconnected");
                        self.streaming = false;
                    }
                }
                match commands.try_recv() {
                    Ok(command) => command,
                    Err(TryRecvError::Empty) => continue,
                    Err(TryRecvError::Disconnected) => return Flow::Shutdown,
                }
            } else {
                match commands.recv() {
                    Ok(command) => command,
                    Err(_) => return Flow::Shutdown,
                }
            };

            match command {
                Command::ListCameras(reply) => {
                    let _ = reply.send(Ok(camera_ids(mgr)));
                }
                Command::Acquire(id, reply) => {
                    let error = if id == self.id {
                        CaptureError::DeviceBusy(id)
                    } else {
                        CaptureError::DeviceBusy(format!(
                            "{} (camera {} is held by this manager)",
                            id, self.id
                        ))
                    };
                    let _ = reply.send(Err(error));
                }
                Command::SetCallback(callback) => self.callback = Some(callback),
                Command::GenerateConfiguration(role, reply) => {
                    let _ = reply.send(self.generate_configuration(role));
                }
                Command::Validate(config, reply) => {
                    let _ = reply.send(self.validate(config));
                }
                Command::Configure(config, reply) => {
                    let _ = reply.send(self.configure(&config));
                }
                Command::Allocate(reply) => {
                    let _ = reply.send(self.allocate());
                }
                Command::Free(reply) => {
                    let _ = reply.send(self.free());
                }
                Command::CreateRequest(cookie, reply) => {
                    let _ = reply.send(self.create_request(cookie));
                }
                Command::AttachBuffer {
                    cookie,
                    index,
                    allocation,
                    reply,
                } => {
                    let _ = reply.send(self.attach_buffer(cookie, index, allocation));
                }
                Command::Start(reply) => {
                    let _ = reply.send(self.start());
                }
                Command::Queue(request) => self.queue(request),
                Command::Stop(reply) => {
                    let _ = reply.send(self.stop());
                }
                Command::Release(reply) => {
                    self.shutdown();
                    info!(camera = %self.id, "Camera released");
                    let _ = reply.send(Ok(()));
                    return Flow::Released;
                }
                Command::Shutdown => return Flow::Shutdown,
            }
        }
    }

    fn generate_configuration(&mut self, role: StreamRole) -> CaptureResult<StreamConfiguration> {
        let mut config = self
            .cam
            .generate_configuration(&[stream_role(role)])
            .ok_or_else(|| {
                CaptureError::ConfigurationUnavailable(format!("no configuration for role {}", role))
            })?;

        // Ask for a layout the decoder understands; validation settles the rest
        if let Some(mut cfg) = config.get_mut(0)
            && from_libcamera(cfg.get_pixel_format()).is_none()
        {
            debug!(
                format = %format_name(cfg.get_pixel_format()),
                "Default pixel format not decodable, requesting YUV420"
            );
            cfg.set_pixel_format(to_libcamera(PixelFormat::I420));
        }

        let ours = read_configuration(&config, role).ok_or_else(|| {
            CaptureError::ConfigurationUnavailable("empty camera configuration".to_string())
        })?;
        self.config = Some(config);
        self.role = role;
        Ok(ours)
    }

    fn validate(
        &mut self,
        mut requested: StreamConfiguration,
    ) -> CaptureResult<(StreamConfiguration, ConfigurationStatus)> {
        let role = self.role;
        let config = self.config_for(&requested)?;
        let status = match config.validate() {
            CameraConfigurationStatus::Valid => ConfigurationStatus::Valid,
            CameraConfigurationStatus::Adjusted => ConfigurationStatus::Adjusted,
            CameraConfigurationStatus::Invalid => ConfigurationStatus::Invalid,
        };
        match read_configuration(config, role) {
            Some(adjusted) => Ok((adjusted, status)),
            None => {
                // Driver picked a layout we cannot decode; keep the request
                requested.role = role;
                Ok((requested, ConfigurationStatus::Invalid))
            }
        }
    }

    fn configure(&mut self, requested: &StreamConfiguration) -> CaptureResult<StreamFormat> {
        if self.streaming {
            return Err(CaptureError::ConfigurationRejected(
                "camera is streaming".to_string(),
            ));
        }
        let role = self.role;
        self.config_for(requested)?;
        let Some(config) = self.config.as_mut() else {
            return Err(CaptureError::ConfigurationRejected(
                "no configuration generated".to_string(),
            ));
        };
        self.active
            .configure(config)
            .map_err(|e| CaptureError::ConfigurationRejected(format!("{}: {}", self.id, e)))?;

        let applied = read_configuration(config, role).ok_or_else(|| {
            CaptureError::ConfigurationRejected("configured pixel format is not decodable".to_string())
        })?;
        self.stream = config.get(0).and_then(|cfg| cfg.stream());
        if self.stream.is_none() {
            return Err(CaptureError::ConfigurationRejected(
                "configured stream is missing".to_string(),
            ));
        }

        let format = StreamFormat::from_configuration(&applied);
        info!(
            camera = %self.id,
            config = config.to_string_repr(),
            "Configuration applied"
        );
        Ok(format)
    }

    /// Copy our fields into the generated libcamera configuration
    fn config_for(&mut self, requested: &StreamConfiguration) -> CaptureResult<&mut CameraConfiguration> {
        let config = self.config.as_mut().ok_or_else(|| {
            CaptureError::InvalidState("no configuration generated".to_string())
        })?;
        if let Some(mut cfg) = config.get_mut(0) {
            cfg.set_pixel_format(to_libcamera(requested.pixel_format));
            cfg.set_size(libcamera::geometry::Size::new(
                requested.size.width,
                requested.size.height,
            ));
            if requested.buffer_count > 0 {
                cfg.set_buffer_count(requested.buffer_count);
            }
        }
        Ok(config)
    }

    fn allocate(&mut self) -> CaptureResult<Vec<Arc<FrameBuffer>>> {
        if self.streaming {
            return Err(CaptureError::AllocationFailed("camera is streaming".to_string()));
        }
        if self.stream.is_none() {
            return Err(CaptureError::AllocationFailed(
                "camera is not configured".to_string(),
            ));
        }
        self.free()?;

        let mut allocator = FrameBufferAllocator::new(self.cam);
        let Some(stream) = self.stream.as_ref() else {
            return Err(CaptureError::AllocationFailed(
                "camera is not configured".to_string(),
            ));
        };
        let buffers = allocator
            .alloc(stream)
            .map_err(|e| CaptureError::AllocationFailed(format!("{}: {}", self.id, e)))?;

        self.allocation += 1;
        let mut ours = Vec::with_capacity(buffers.len());
        for (index, buffer) in buffers.iter().enumerate() {
            ours.push(Arc::new(describe_buffer(index, self.allocation, buffer)?));
        }

        debug!(camera = %self.id, count = buffers.len(), "Frame buffers allocated");
        self.unattached = buffers.into_iter().map(Some).collect();
        self._allocator = Some(allocator);
        Ok(ours)
    }

    fn free(&mut self) -> CaptureResult<()> {
        if self.streaming {
            return Err(CaptureError::InvalidState(
                "cannot free buffers while streaming".to_string(),
            ));
        }
        // Requests own their attached buffers
        self.idle.clear();
        self.queued.clear();
        self.unattached.clear();
        self._allocator = None;
        Ok(())
    }

    fn create_request(&mut self, cookie: u64) -> CaptureResult<()> {
        if self.idle.contains_key(&cookie) {
            return Err(CaptureError::RequestCreationFailed(format!(
                "request {} already exists",
                cookie
            )));
        }
        let request = self.active.create_request(Some(cookie)).ok_or_else(|| {
            CaptureError::RequestCreationFailed(format!("{}: request {}", self.id, cookie))
        })?;
        self.idle.insert(cookie, request);
        Ok(())
    }

    fn attach_buffer(&mut self, cookie: u64, index: usize, allocation: u64) -> CaptureResult<()> {
        if allocation != self.allocation {
            return Err(CaptureError::BufferBindingFailed(format!(
                "buffer {} belongs to a freed allocation",
                index
            )));
        }
        let stream = self.stream.as_ref().ok_or_else(|| {
            CaptureError::BufferBindingFailed("camera is not configured".to_string())
        })?;
        let request = self.idle.get_mut(&cookie).ok_or_else(|| {
            CaptureError::BufferBindingFailed(format!("unknown request {}", cookie))
        })?;
        let buffer = self
            .unattached
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                CaptureError::BufferBindingFailed(format!("buffer {} is not available", index))
            })?;
        request
            .add_buffer(stream, buffer)
            .map_err(|e| CaptureError::BufferBindingFailed(format!("buffer {}: {}", index, e)))
    }

    fn start(&mut self) -> CaptureResult<()> {
        if self.streaming {
            return Ok(());
        }
        self.active
            .start(None)
            .map_err(|e| CaptureError::StartFailed(format!("{}: {}", self.id, e)))?;
        self.streaming = true;
        info!(camera = %self.id, "Camera started");
        Ok(())
    }

    fn queue(&mut self, mut request: Request) {
        let cookie = request.cookie();
        if !self.streaming {
            debug!(cookie, "Request queued after stop, cancelling");
            request.cancel();
            self.deliver(request);
            return;
        }
        let Some(lc_request) = self.idle.remove(&cookie) else {
            warn!(cookie, "No libcamera request for cookie, cancelling");
            request.cancel();
            self.deliver(request);
            return;
        };

        match self.active.queue_request(lc_request) {
            Ok(()) => {
                self.queued.insert(cookie, request);
            }
            Err((lc_request, e)) => {
                warn!(cookie, error = %e, "Failed to queue request");
                self.idle.insert(cookie, lc_request);
                request.cancel();
                self.deliver(request);
            }
        }
    }

    /// Translate one completed libcamera request and hand it to the callback
    fn complete(&mut self, mut lc_request: LcRequest) {
        let cookie = lc_request.cookie();
        let Some(mut request) = self.queued.remove(&cookie) else {
            warn!(cookie, "Completion for an unknown request");
            lc_request.reuse(ReuseFlag::REUSE_BUFFERS);
            self.idle.insert(cookie, lc_request);
            return;
        };

        match lc_request.status() {
            LcRequestStatus::Complete => {
                let metadata = self
                    .stream
                    .as_ref()
                    .and_then(|stream| lc_request.buffer::<LcFrameBuffer>(stream))
                    .and_then(|buffer| buffer.metadata())
                    .map(|m| FrameMetadata {
                        sequence: m.sequence(),
                        timestamp: Duration::from_nanos(m.timestamp()),
                        bytes_used: m
                            .planes()
                            .into_iter()
                            .map(|plane| plane.bytes_used as usize)
                            .collect(),
                    })
                    .unwrap_or_else(|| FrameMetadata {
                        sequence: lc_request.sequence(),
                        ..FrameMetadata::default()
                    });
                request.complete(metadata);
            }
            status => {
                debug!(cookie, status = ?status, "Request did not complete");
                request.cancel();
            }
        }

        lc_request.reuse(ReuseFlag::REUSE_BUFFERS);
        self.idle.insert(cookie, lc_request);
        self.deliver(request);
    }

    fn deliver(&mut self, request: Request) {
        match self.callback.as_mut() {
            Some(callback) => callback(request),
            None => debug!(cookie = request.cookie(), "No completion subscriber"),
        }
    }

    /// Stop streaming; every queued request comes back cancelled before this returns
    fn stop(&mut self) -> CaptureResult<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        let result = self
            .active
            .stop()
            .map_err(|e| CaptureError::InvalidState(format!("stop {}: {}", self.id, e)));

        while let Ok(lc_request) = self.completions.try_recv() {
            self.complete(lc_request);
        }
        let leftover: Vec<u64> = self.queued.keys().copied().collect();
        for cookie in leftover {
            if let Some(mut request) = self.queued.remove(&cookie) {
                request.cancel();
                self.deliver(request);
            }
        }
        info!(camera = %self.id, "Camera stopped");
        result
    }

    /// Stop and free; the camera itself is released when the session drops
    fn shutdown(&mut self) {
        if let Err(e) = self.stop() {
            warn!(camera = %self.id, error = %e, "Failed to stop camera");
        }
        let _ = self.free();
        self.config = None;
        self.stream = None;
        self.callback = None;
    }
}

/// Our view of one libcamera configuration entry
fn read_configuration(config: &CameraConfiguration, role: StreamRole) -> Option<StreamConfiguration> {
    let cfg = config.get(0)?;
    let pixel_format = from_libcamera(cfg.get_pixel_format())?;
    let size = cfg.get_size();
    Some(StreamConfiguration {
        role,
        pixel_format,
        size: Size::new(size.width, size.height),
        stride: cfg.get_stride(),
        frame_size: cfg.get_frame_size(),
        buffer_count: cfg.get_buffer_count(),
    })
}

/// Duplicate the plane descriptors of a libcamera buffer
///
/// Planes on the same dmabuf share one duplicated descriptor.
fn describe_buffer(index: usize, allocation: u64, buffer: &LcFrameBuffer) -> CaptureResult<FrameBuffer> {
    let mut fds: HashMap<i32, Arc<OwnedFd>> = HashMap::new();
    let mut planes = Vec::new();

    for plane in buffer.planes().into_iter() {
        let raw = plane.fd();
        let fd = match fds.get(&raw) {
            Some(fd) => Arc::clone(fd),
            None => {
                // SAFETY: the descriptor stays open for the allocator's lifetime,
                // which outlives this call; we only duplicate it.
                let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
                let owned = borrowed.try_clone_to_owned().map_err(|e| {
                    CaptureError::AllocationFailed(format!("dup plane fd of buffer {}: {}", index, e))
                })?;
                let owned = Arc::new(owned);
                fds.insert(raw, Arc::clone(&owned));
                owned
            }
        };
        planes.push(Plane::new(fd, plane.offset().unwrap_or(0), plane.len()));
    }

    Ok(FrameBuffer::new(index, allocation, planes))
}

/// Set while a camera thread (and with it a CameraManager) exists
///
/// libcamera allows one CameraManager per process.
pub(super) static MANAGER_ACTIVE: AtomicBool = AtomicBool::new(false);

pub(super) fn claim_manager() -> bool {
    MANAGER_ACTIVE
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

pub(super) fn release_manager() {
    MANAGER_ACTIVE.store(false, Ordering::Release);
}
