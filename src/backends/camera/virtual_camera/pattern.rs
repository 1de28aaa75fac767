// SPDX-License-Identifier: GPL-3.0-only

//! Synthetic color bar frames for the virtual camera

use crate::backends::camera::types::{PixelFormat, StreamFormat};
use image::RgbImage;

/// SMPTE-style bars, left to right
const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

/// Quality used for MJPEG frames
const MJPEG_QUALITY: u8 = 85;

/// Color of column `x` in a frame `width` pixels wide
pub fn bar_color(x: u32, width: u32) -> [u8; 3] {
    let index = (x as usize * BARS.len()) / width.max(1) as usize;
    BARS[index.min(BARS.len() - 1)]
}

/// BT.601 full-range RGB to YUV
fn rgb_to_yuv([r, g, b]: [u8; 3]) -> (u8, u8, u8) {
    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
    let clamp = |val: f32| val.round().clamp(0.0, 255.0) as u8;
    (clamp(y), clamp(u), clamp(v))
}

/// Render one frame of color bars in the layout of `format`
///
/// Raw formats come back exactly `format.frame_size()` bytes long with
/// planes packed back to back. MJPEG returns the compressed bitstream.
pub fn render(format: &StreamFormat) -> Result<Vec<u8>, String> {
    let width = format.width();
    let height = format.height();
    let stride = format.stride() as usize;
    let mut frame = vec![0u8; format.frame_size()];

    match format.pixel_format() {
        PixelFormat::I420 => {
            let layout = format.plane_layout();
            let chroma_stride = stride.div_ceil(2);
            for y in 0..height as usize {
                for x in 0..width {
                    let (luma, _, _) = rgb_to_yuv(bar_color(x, width));
                    frame[y * stride + x as usize] = luma;
                }
            }
            for cy in 0..(height as usize).div_ceil(2) {
                for cx in 0..width.div_ceil(2) {
                    let (_, u, v) = rgb_to_yuv(bar_color(cx * 2, width));
                    let at = cy * chroma_stride + cx as usize;
                    frame[layout[1].0 + at] = u;
                    frame[layout[2].0 + at] = v;
                }
            }
        }
        PixelFormat::NV12 | PixelFormat::NV21 => {
            let layout = format.plane_layout();
            let swap = format.pixel_format() == PixelFormat::NV21;
            for y in 0..height as usize {
                for x in 0..width {
                    let (luma, _, _) = rgb_to_yuv(bar_color(x, width));
                    frame[y * stride + x as usize] = luma;
                }
            }
            for cy in 0..(height as usize).div_ceil(2) {
                for cx in 0..width.div_ceil(2) {
                    let (_, u, v) = rgb_to_yuv(bar_color(cx * 2, width));
                    let at = layout[1].0 + cy * stride + cx as usize * 2;
                    let (first, second) = if swap { (v, u) } else { (u, v) };
                    frame[at] = first;
                    frame[at + 1] = second;
                }
            }
        }
        PixelFormat::YUYV => {
            for y in 0..height as usize {
                for pair in 0..width.div_ceil(2) {
                    let x0 = pair * 2;
                    let x1 = (x0 + 1).min(width - 1);
                    let (y0, u, v) = rgb_to_yuv(bar_color(x0, width));
                    let (y1, _, _) = rgb_to_yuv(bar_color(x1, width));
                    let at = y * stride + pair as usize * 4;
                    frame[at..at + 4].copy_from_slice(&[y0, u, y1, v]);
                }
            }
        }
        PixelFormat::RGB888 | PixelFormat::BGR888 => {
            let swap = format.pixel_format() == PixelFormat::BGR888;
            for y in 0..height as usize {
                for x in 0..width {
                    let [r, g, b] = bar_color(x, width);
                    let at = y * stride + x as usize * 3;
                    let pixel = if swap { [b, g, r] } else { [r, g, b] };
                    frame[at..at + 3].copy_from_slice(&pixel);
                }
            }
        }
        PixelFormat::MJPEG => {
            let image = RgbImage::from_fn(width, height, |x, _| image::Rgb(bar_color(x, width)));
            let mut encoded = Vec::new();
            {
                let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    &mut encoded,
                    MJPEG_QUALITY,
                );
                encoder
                    .encode(
                        image.as_raw(),
                        width,
                        height,
                        image::ExtendedColorType::Rgb8,
                    )
                    .map_err(|e| format!("MJPEG encoding failed: {}", e))?;
            }
            return Ok(encoded);
        }
    }

    Ok(frame)
}
