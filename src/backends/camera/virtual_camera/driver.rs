// SPDX-License-Identifier: GPL-3.0-only

//! Event thread of a virtual camera
//!
//! Owns every queued request until it completes. One frame is produced per
//! frame interval, oldest request first; on stop the remaining queue drains
//! as cancelled completions.

use super::{FaultPlan, lock};
use crate::backends::camera::types::{
    CompletionCallback, FrameBuffer, FrameMetadata, Request, StreamFormat,
};
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Messages accepted by the event thread
pub(super) enum DriverMessage {
    Queue(Request),
    Stop,
}

/// Everything the event thread needs, moved in at spawn time
pub(super) struct DriverParams {
    pub camera_id: String,
    pub format: StreamFormat,
    pub frame_interval: Duration,
    pub faults: FaultPlan,
    pub callback: Arc<Mutex<Option<CompletionCallback>>>,
}

pub(super) fn driver_main(params: DriverParams, rx: Receiver<DriverMessage>) {
    let DriverParams {
        camera_id,
        format,
        frame_interval,
        faults,
        callback,
    } = params;

    let frame = match super::pattern::render(&format) {
        Ok(frame) => frame,
        Err(e) => {
            error!(camera = %camera_id, error = %e, "Failed to render test pattern");
            Vec::new()
        }
    };

    info!(camera = %camera_id, format = %format, "Virtual camera streaming");

    let started = Instant::now();
    let mut pending: VecDeque<Request> = VecDeque::new();
    let mut sequence: u32 = 0;
    let mut cancelled: usize = 0;
    let mut corrupted: usize = 0;

    loop {
        let message = if pending.is_empty() {
            match rx.recv() {
                Ok(message) => Some(message),
                Err(_) => break,
            }
        } else {
            match rx.recv_timeout(frame_interval) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        match message {
            Some(DriverMessage::Queue(request)) => {
                trace!(cookie = request.cookie(), "Request queued");
                pending.push_back(request);
                continue;
            }
            Some(DriverMessage::Stop) => break,
            None => {}
        }

        let Some(mut request) = pending.pop_front() else {
            continue;
        };

        if faults.cancel_all || cancelled < faults.cancel_first {
            cancelled += 1;
            debug!(cookie = request.cookie(), "Injecting cancelled completion");
            request.cancel();
            deliver(&callback, request);
            continue;
        }

        let mut bytes_used = match request.buffer() {
            Some(buffer) => match fill_buffer(buffer, &frame, format.pixel_format().is_compressed())
            {
                Ok(bytes_used) => bytes_used,
                Err(e) => {
                    warn!(cookie = request.cookie(), error = %e, "Failed to write frame");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if corrupted < faults.corrupt_first {
            corrupted += 1;
            debug!(cookie = request.cookie(), "Injecting truncated frame");
            bytes_used.iter_mut().for_each(|used| *used = (*used).min(1));
        }

        request.complete(FrameMetadata {
            sequence,
            timestamp: started.elapsed(),
            bytes_used,
        });
        sequence = sequence.wrapping_add(1);
        deliver(&callback, request);
    }

    // Requests queued after the stop message still belong to this thread
    while let Ok(message) = rx.try_recv() {
        if let DriverMessage::Queue(request) = message {
            pending.push_back(request);
        }
    }

    let drained = pending.len();
    for mut request in pending.drain(..) {
        request.cancel();
        deliver(&callback, request);
    }

    info!(
        camera = %camera_id,
        frames = sequence,
        cancelled = drained,
        "Virtual camera stopped"
    );
}

fn deliver(callback: &Mutex<Option<CompletionCallback>>, request: Request) {
    let mut guard = lock(callback);
    match guard.as_mut() {
        Some(callback) => callback(request),
        None => trace!(cookie = request.cookie(), "No completion subscriber"),
    }
}

/// Copy the rendered frame into the buffer memory and report bytes used per plane
fn fill_buffer(buffer: &FrameBuffer, frame: &[u8], compressed: bool) -> std::io::Result<Vec<usize>> {
    let Some(span) = buffer.primary_span() else {
        return Ok(Vec::new());
    };
    let file = File::from(span.fd().try_clone_to_owned()?);
    let len = frame.len().min(span.len());
    file.write_all_at(&frame[..len], span.offset() as u64)?;

    if compressed {
        Ok(vec![len])
    } else {
        Ok(buffer.planes().iter().map(|plane| plane.len()).collect())
    }
}
