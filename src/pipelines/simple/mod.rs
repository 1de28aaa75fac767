// SPDX-License-Identifier: GPL-3.0-only

//! One-frame V4L2 capture written as PPM
//!
//! For sensors without a libcamera pipeline handler. No request circulation:
//! open the node, grab one frame through a short mmap stream, convert it to
//! RGB and write it.
//!
//! ```text
//! open(/dev/videoN) → grab (warm-up + 1 frame) → retrieve (RGB) → write (P6)
//! ```

pub mod ppm;

use crate::backends::camera::types::{PixelFormat, StreamFormat};
use crate::constants::{SIMPLE_CAPTURE_BUFFER_COUNT, SIMPLE_CAPTURE_WARMUP_FRAMES};
use crate::errors::{AppError, AppResult};
use crate::pipelines::photo::processing::decode_frame;
use image::RgbImage;
use std::path::Path;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Formats tried, in order, when the node's current format is not decodable
const PREFERRED_FOURCCS: [&[u8; 4]; 3] = [b"YUYV", b"RGB3", b"MJPG"];

fn simple_error(context: &str, err: impl std::fmt::Display) -> AppError {
    AppError::SimpleCapture(format!("{}: {}", context, err))
}

/// Raw bytes of one grabbed frame
struct RawFrame {
    data: Vec<u8>,
    sequence: u32,
}

pub struct SimpleCapture {
    index: usize,
    device: Option<Device>,
    format: Option<StreamFormat>,
    frame: Option<RawFrame>,
}

impl SimpleCapture {
    /// Capture from `/dev/video<index>`
    pub fn new(index: usize) -> Self {
        Self {
            index,
            device: None,
            format: None,
            frame: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Format the node delivers, once opened
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    /// Open the node and settle on a decodable format
    pub fn open(&mut self) -> AppResult<()> {
        let device = Device::new(self.index)
            .map_err(|e| simple_error(&format!("open /dev/video{}", self.index), e))?;

        let caps = device
            .query_caps()
            .map_err(|e| simple_error("query capabilities", e))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(AppError::SimpleCapture(format!(
                "{} ({}) cannot capture video",
                caps.card, caps.driver
            )));
        }
        info!(card = %caps.card, driver = %caps.driver, "V4L2 device opened");

        let format = negotiate_format(&device)?;
        info!(format = %format, "V4L2 format selected");

        self.device = Some(device);
        self.format = Some(format);
        self.frame = None;
        Ok(())
    }

    /// Stream a few warm-up frames, keep the next one
    pub fn grab(&mut self) -> AppResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| AppError::SimpleCapture("device is not open".to_string()))?;

        let mut stream = Stream::with_buffers(device, Type::VideoCapture, SIMPLE_CAPTURE_BUFFER_COUNT)
            .map_err(|e| simple_error("create buffer stream", e))?;

        for _ in 0..SIMPLE_CAPTURE_WARMUP_FRAMES {
            stream
                .next()
                .map_err(|e| simple_error("warm-up frame", e))?;
        }

        let (buf, meta) = stream.next().map_err(|e| simple_error("grab frame", e))?;
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            used => used.min(buf.len()),
        };
        debug!(sequence = meta.sequence, bytes = used, "Frame grabbed");

        self.frame = Some(RawFrame {
            data: buf[..used].to_vec(),
            sequence: meta.sequence,
        });
        Ok(())
    }

    /// Convert the grabbed frame to RGB
    pub fn retrieve(&self) -> AppResult<RgbImage> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| AppError::SimpleCapture("no frame grabbed".to_string()))?;
        let format = self
            .format
            .ok_or_else(|| AppError::SimpleCapture("device is not open".to_string()))?;

        let offsets: Vec<usize> = format.plane_layout().iter().map(|(offset, _)| *offset).collect();
        let captured = decode_frame(&frame.data, &offsets, &format, frame.sequence)
            .map_err(|e| simple_error("convert frame", e))?;
        Ok(captured.image)
    }

    /// Write the grabbed frame as PPM
    pub fn write(&self, path: &Path) -> AppResult<()> {
        let image = self.retrieve()?;
        ppm::write_ppm(&image, path).map_err(|e| simple_error(&path.display().to_string(), e))?;
        info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "PPM image written"
        );
        Ok(())
    }

    pub fn close(&mut self) {
        if self.device.take().is_some() {
            debug!(index = self.index, "V4L2 device closed");
        }
        self.format = None;
        self.frame = None;
    }
}

/// Keep the current format when decodable, otherwise ask for one we know
fn negotiate_format(device: &Device) -> AppResult<StreamFormat> {
    let current = device
        .format()
        .map_err(|e| simple_error("query format", e))?;
    if let Some(format) = stream_format(&current) {
        return Ok(format);
    }
    debug!(fourcc = %current.fourcc, "Current V4L2 format not supported, negotiating");

    for code in PREFERRED_FOURCCS {
        let mut wanted = current.clone();
        wanted.fourcc = FourCC::new(code);
        match device.set_format(&wanted) {
            Ok(applied) => {
                if let Some(format) = stream_format(&applied) {
                    return Ok(format);
                }
            }
            Err(e) => warn!(fourcc = %wanted.fourcc, error = %e, "V4L2 format refused"),
        }
    }

    Err(AppError::SimpleCapture(format!(
        "no supported pixel format (device offers {})",
        current.fourcc
    )))
}

fn stream_format(format: &v4l::Format) -> Option<StreamFormat> {
    let code = format.fourcc.str().ok()?;
    let pixel_format = PixelFormat::from_fourcc(code)?;
    Some(StreamFormat::new(
        pixel_format,
        format.width,
        format.height,
        format.stride,
    ))
}
