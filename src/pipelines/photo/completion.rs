// SPDX-License-Identifier: GPL-3.0-only

//! Completion handling on the driver's event thread
//!
//! For every completed request:
//!
//! ```text
//! cancelled? ──yes──► report, drop (terminal for that buffer)
//!     │no
//! armed frame? ──no──► requeue untouched
//!     │yes
//! map primary plane (RAII) → decode with StreamFormat → unmap
//!     → encode → write → report
//!     │
//! requeue (reuse + queue)
//! ```
//!
//! Per-frame failures are reported through the outcome channel and counted;
//! they never stop the batch. The armed-frame budget makes each `capture()`
//! persist exactly the number of frames it asked for.

use super::encoding::PhotoEncoder;
use super::processing::decode_frame;
use crate::backends::camera::types::{FrameBuffer, FrameMetadata, Plane, Request, StreamFormat};
use crate::backends::camera::{CompletionCallback, MappedPlane, RequestQueue};
use crate::errors::{CaptureError, FrameError};
use crate::storage::OutputSequence;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// What happened to one completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was written to `path`
    Saved {
        cookie: u64,
        sequence: u32,
        path: PathBuf,
    },
    /// The frame was armed but could not be persisted; the buffer went back
    /// into circulation
    Failed { cookie: u64, error: FrameError },
    /// The driver cancelled the request; its buffer is out of circulation
    Cancelled { cookie: u64 },
    /// The request could not be requeued; its buffer is out of circulation
    Lost { cookie: u64, error: CaptureError },
}

/// Running totals of the completion path
#[derive(Debug, Default)]
pub struct CompletionCounters {
    completed: AtomicU64,
    saved: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    skipped: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time copy of [`CompletionCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionStats {
    pub completed: u64,
    pub saved: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Completions requeued without processing (no armed frame)
    pub skipped: u64,
    pub requeued: u64,
}

impl CompletionCounters {
    pub fn snapshot(&self) -> CompletionStats {
        CompletionStats {
            completed: self.completed.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the session thread and the completion handler
#[derive(Debug, Default)]
pub struct CaptureShared {
    /// Frames the session still wants persisted
    armed: AtomicU64,
    /// Requests currently owned by the device or the handler
    in_flight: AtomicUsize,
    counters: CompletionCounters,
}

impl CaptureShared {
    pub fn arm(&self, frames: u64) {
        self.armed.store(frames, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(0, Ordering::SeqCst);
    }

    pub fn armed(&self) -> u64 {
        self.armed.load(Ordering::SeqCst)
    }

    /// Take one armed frame, if any is left
    fn try_claim(&self) -> bool {
        self.armed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |armed| armed.checked_sub(1))
            .is_ok()
    }

    /// Give back a claimed frame after a per-frame failure
    fn unclaim(&self) {
        self.armed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight_counter(&self) -> &AtomicUsize {
        &self.in_flight
    }

    /// Forget every request (after the device stopped)
    pub fn reset_in_flight(&self) {
        self.in_flight.store(0, Ordering::SeqCst);
    }

    fn request_gone(&self) -> usize {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CompletionStats {
        self.counters.snapshot()
    }
}

/// Processes completed requests for one streaming run
pub struct CompletionHandler {
    session_id: Uuid,
    format: StreamFormat,
    encoder: PhotoEncoder,
    output: Arc<OutputSequence>,
    queue: Arc<dyn RequestQueue>,
    shared: Arc<CaptureShared>,
    outcomes: SyncSender<FrameOutcome>,
}

impl CompletionHandler {
    pub fn new(
        session_id: Uuid,
        format: StreamFormat,
        encoder: PhotoEncoder,
        output: Arc<OutputSequence>,
        queue: Arc<dyn RequestQueue>,
        shared: Arc<CaptureShared>,
        outcomes: SyncSender<FrameOutcome>,
    ) -> Self {
        Self {
            session_id,
            format,
            encoder,
            output,
            queue,
            shared,
            outcomes,
        }
    }

    /// Entry point, called on the device's event thread
    pub fn handle(&self, request: Request) {
        let cookie = request.cookie();
        let counters = &self.shared.counters;
        counters.completed.fetch_add(1, Ordering::Relaxed);

        if request.is_cancelled() {
            counters.cancelled.fetch_add(1, Ordering::Relaxed);
            let remaining = self.shared.request_gone();
            warn!(
                session = %self.session_id,
                cookie,
                remaining,
                "Request cancelled"
            );
            self.report(FrameOutcome::Cancelled { cookie });
            return;
        }

        if !self.shared.try_claim() {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(cookie, "Frame not armed, requeueing");
            self.requeue(request);
            return;
        }

        match self.persist(&request) {
            Ok((path, sequence)) => {
                counters.saved.fetch_add(1, Ordering::Relaxed);
                self.report(FrameOutcome::Saved {
                    cookie,
                    sequence,
                    path,
                });
            }
            Err(error) => {
                self.shared.unclaim();
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session = %self.session_id,
                    cookie,
                    error = %error,
                    "Frame dropped"
                );
                self.report(FrameOutcome::Failed { cookie, error });
            }
        }

        self.requeue(request);
    }

    /// Map, decode, unmap, encode, write
    fn persist(&self, request: &Request) -> Result<(PathBuf, u32), FrameError> {
        let buffer = request.buffer().ok_or(FrameError::NoPlanes)?;
        let span = buffer.primary_span().ok_or(FrameError::NoPlanes)?;
        let sequence = request.metadata().map(|m| m.sequence).unwrap_or(0);

        let captured = {
            let mapped = MappedPlane::map(&span)?;
            let offsets = plane_offsets(buffer, &span, &self.format);
            let payload = payload_len(
                mapped.len(),
                &offsets,
                request.metadata(),
                self.format.pixel_format().is_compressed(),
            );
            decode_frame(
                &mapped.as_slice()[..payload],
                &offsets,
                &self.format,
                sequence,
            )?
        };

        let encoded = self.encoder.encode(&captured)?;
        let path = self.output.next_path(encoded.format.extension());
        let path = self.encoder.save(&encoded, &path)?;
        Ok((path, sequence))
    }

    /// Mark reusable and hand back to the device
    fn requeue(&self, mut request: Request) {
        let cookie = request.cookie();
        let result = request
            .reuse()
            .and_then(|()| self.queue.queue(request));

        match result {
            Ok(()) => {
                self.shared.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                let remaining = self.shared.request_gone();
                warn!(
                    session = %self.session_id,
                    cookie,
                    remaining,
                    error = %error,
                    "Failed to requeue request"
                );
                self.report(FrameOutcome::Lost { cookie, error });
            }
        }
    }

    fn report(&self, outcome: FrameOutcome) {
        if let Err(TrySendError::Full(outcome)) = self.outcomes.try_send(outcome) {
            trace!(?outcome, "Outcome channel full, dropping report");
        }
    }
}

/// Start of every plane relative to the mapped span
///
/// Falls back to the packed layout of `format` when the buffer's planes don't
/// describe one contiguous object (or there are fewer than the format needs).
fn plane_offsets(buffer: &FrameBuffer, span: &Plane, format: &StreamFormat) -> Vec<usize> {
    let planes = buffer.planes();
    let contiguous = planes.len() >= format.pixel_format().plane_count()
        && planes.iter().all(|plane| {
            plane.shares_memory_with(span)
                && plane.offset() >= span.offset()
                && plane.offset() + plane.len() <= span.offset() + span.len()
        });

    if contiguous {
        planes
            .iter()
            .map(|plane| plane.offset() - span.offset())
            .collect()
    } else {
        format
            .plane_layout()
            .iter()
            .map(|(offset, _)| *offset)
            .collect()
    }
}

/// Bytes of the mapping that hold frame data according to the driver
fn payload_len(
    mapped: usize,
    offsets: &[usize],
    metadata: Option<&FrameMetadata>,
    compressed: bool,
) -> usize {
    let Some(metadata) = metadata else {
        return mapped;
    };
    let used = &metadata.bytes_used;
    let reported = if compressed || used.len() == 1 {
        used.first().copied()
    } else if used.len() == offsets.len() {
        offsets
            .iter()
            .zip(used.iter())
            .map(|(offset, used)| offset + used)
            .max()
    } else {
        None
    };
    match reported {
        Some(len) if len > 0 => len.min(mapped),
        _ => mapped,
    }
}

/// Routes completions to the handler of the current streaming run
///
/// The device gets its callback at acquisition time, long before the handler
/// exists; this slot bridges the two.
#[derive(Default)]
pub struct CompletionDispatch {
    handler: RwLock<Option<Arc<CompletionHandler>>>,
}

impl CompletionDispatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, handler: CompletionHandler) {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(handler));
    }

    pub fn clear(&self) {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    pub fn is_installed(&self) -> bool {
        self.handler
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn dispatch(&self, request: Request) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => handler.handle(request),
            None => debug!(cookie = request.cookie(), "Completion without handler dropped"),
        }
    }

    /// Device callback forwarding into this dispatch
    pub fn callback(self: &Arc<Self>) -> CompletionCallback {
        let dispatch = Arc::clone(self);
        Box::new(move |request| dispatch.dispatch(request))
    }
}
