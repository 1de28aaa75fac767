// SPDX-License-Identifier: GPL-3.0-only

//! Frame decoding for completed capture buffers
//!
//! Turns the mapped bytes of a completed buffer into RGB pixels according to
//! the negotiated [`StreamFormat`]: its pixel layout, dimensions and stride.
//! YUV layouts are converted with ITU-R BT.601 (full range).

use crate::backends::camera::types::{PixelFormat, StreamFormat};
use crate::errors::FrameError;
use image::{ImageFormat, RgbImage};
use tracing::{debug, warn};

/// Decoded RGB pixels of one frame, alive only until it is written out
pub struct CapturedImage {
    pub image: RgbImage,
    /// Layout the pixels were decoded from
    pub source_format: PixelFormat,
    /// Driver sequence number of the frame
    pub sequence: u32,
}

impl CapturedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Decode one frame
///
/// `data` starts at the first plane; `plane_offsets` gives the start of
/// every plane inside `data` (only the first is used by packed layouts).
pub fn decode_frame(
    data: &[u8],
    plane_offsets: &[usize],
    format: &StreamFormat,
    sequence: u32,
) -> Result<CapturedImage, FrameError> {
    let width = format.width() as usize;
    let height = format.height() as usize;
    if width == 0 || height == 0 {
        return Err(FrameError::DecodeFailed("empty frame dimensions".to_string()));
    }

    let stride = format.stride() as usize;
    let rgb = match format.pixel_format() {
        PixelFormat::MJPEG => {
            let image = decode_mjpeg(data)?;
            if image.width() != format.width() || image.height() != format.height() {
                warn!(
                    expected = %format.size(),
                    actual = %format!("{}x{}", image.width(), image.height()),
                    "MJPEG frame size differs from negotiated size"
                );
            }
            return Ok(CapturedImage {
                image,
                source_format: PixelFormat::MJPEG,
                sequence,
            });
        }
        PixelFormat::I420 => {
            let chroma_stride = stride.div_ceil(2);
            let chroma_w = width.div_ceil(2);
            let chroma_h = height.div_ceil(2);
            let y_plane = plane(data, plane_offsets, 0, stride, height, width)?;
            let u_plane = plane(data, plane_offsets, 1, chroma_stride, chroma_h, chroma_w)?;
            let v_plane = plane(data, plane_offsets, 2, chroma_stride, chroma_h, chroma_w)?;
            convert_yuv420(y_plane, width, height, stride, |cx, cy| {
                let at = cy * chroma_stride + cx;
                (u_plane[at], v_plane[at])
            })
        }
        PixelFormat::NV12 | PixelFormat::NV21 => {
            let swap = format.pixel_format() == PixelFormat::NV21;
            let chroma_h = height.div_ceil(2);
            let y_plane = plane(data, plane_offsets, 0, stride, height, width)?;
            let uv_plane = plane(
                data,
                plane_offsets,
                1,
                stride,
                chroma_h,
                width.div_ceil(2) * 2,
            )?;
            convert_yuv420(y_plane, width, height, stride, |cx, cy| {
                let at = cy * stride + cx * 2;
                let (first, second) = (uv_plane[at], uv_plane[at + 1]);
                if swap { (second, first) } else { (first, second) }
            })
        }
        PixelFormat::YUYV => {
            let packed = plane(data, plane_offsets, 0, stride, height, width.div_ceil(2) * 4)?;
            convert_yuyv(packed, width, height, stride)
        }
        PixelFormat::RGB888 | PixelFormat::BGR888 => {
            let packed = plane(data, plane_offsets, 0, stride, height, width * 3)?;
            copy_rgb(
                packed,
                width,
                height,
                stride,
                format.pixel_format() == PixelFormat::BGR888,
            )
        }
    };

    let image = RgbImage::from_raw(format.width(), format.height(), rgb).ok_or_else(|| {
        FrameError::DecodeFailed("Failed to create RGB image from buffer".to_string())
    })?;
    debug!(
        format = %format,
        sequence,
        "Frame decoded"
    );
    Ok(CapturedImage {
        image,
        source_format: format.pixel_format(),
        sequence,
    })
}

/// Slice plane `index`, checking that `rows` rows of `row_bytes` fit at `stride`
fn plane<'a>(
    data: &'a [u8],
    plane_offsets: &[usize],
    index: usize,
    stride: usize,
    rows: usize,
    row_bytes: usize,
) -> Result<&'a [u8], FrameError> {
    let offset = *plane_offsets.get(index).ok_or_else(|| {
        FrameError::DecodeFailed(format!("missing offset for plane {}", index))
    })?;
    let required = stride * (rows - 1) + row_bytes;
    let available = data.len().saturating_sub(offset);
    if available < required {
        return Err(FrameError::DecodeFailed(format!(
            "plane {} too short: {} bytes available, {} required",
            index, available, required
        )));
    }
    Ok(&data[offset..offset + required])
}

fn decode_mjpeg(data: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map(|image| image.to_rgb8())
        .map_err(|e| FrameError::DecodeFailed(format!("MJPEG decode failed: {}", e)))
}

/// ITU-R BT.601 full-range YUV to RGB
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = f32::from(y);
    let u = f32::from(u) - 128.0;
    let v = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v, y);
    let g = 0.714_14f32.mul_add(-v, 0.344_14f32.mul_add(-u, y));
    let b = 1.772f32.mul_add(u, y);

    let clamp = |val: f32| val.round().clamp(0.0, 255.0) as u8;
    [clamp(r), clamp(g), clamp(b)]
}

/// 4:2:0 conversion; `chroma(cx, cy)` returns (U, V) of a 2x2 block
fn convert_yuv420(
    y_plane: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    chroma: impl Fn(usize, usize) -> (u8, u8),
) -> Vec<u8> {
    let mut rgb = vec![0u8; width * height * 3];
    for (row, out) in rgb.chunks_exact_mut(width * 3).enumerate() {
        let luma = &y_plane[row * stride..row * stride + width];
        for (x, pixel) in out.chunks_exact_mut(3).enumerate() {
            let (u, v) = chroma(x / 2, row / 2);
            pixel.copy_from_slice(&yuv_to_rgb(luma[x], u, v));
        }
    }
    rgb
}

fn convert_yuyv(packed: &[u8], width: usize, height: usize, stride: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; width * height * 3];
    for (row, out) in rgb.chunks_exact_mut(width * 3).enumerate() {
        let line = &packed[row * stride..];
        for (x, pixel) in out.chunks_exact_mut(3).enumerate() {
            let quad = &line[(x / 2) * 4..(x / 2) * 4 + 4];
            let luma = if x % 2 == 0 { quad[0] } else { quad[2] };
            pixel.copy_from_slice(&yuv_to_rgb(luma, quad[1], quad[3]));
        }
    }
    rgb
}

fn copy_rgb(packed: &[u8], width: usize, height: usize, stride: usize, swap: bool) -> Vec<u8> {
    let row_bytes = width * 3;
    let mut rgb = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let line = &packed[row * stride..row * stride + row_bytes];
        if swap {
            for pixel in line.chunks_exact(3) {
                rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
            }
        } else {
            rgb.extend_from_slice(line);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::virtual_camera::pattern;

    fn offsets(format: &StreamFormat) -> Vec<usize> {
        format.plane_layout().iter().map(|(offset, _)| *offset).collect()
    }

    fn close_to(actual: [u8; 3], expected: [u8; 3]) -> bool {
        actual
            .iter()
            .zip(expected.iter())
            .all(|(a, e)| (i16::from(*a) - i16::from(*e)).abs() <= 3)
    }

    #[test]
    fn test_neutral_chroma_is_gray() {
        assert_eq!(yuv_to_rgb(128, 128, 128), [128, 128, 128]);
        assert_eq!(yuv_to_rgb(0, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(255, 128, 128), [255, 255, 255]);
    }

    #[test]
    fn test_every_format_decodes_color_bars() {
        for pixel_format in PixelFormat::ALL {
            let format = StreamFormat::new(pixel_format, 64, 16, 0);
            let frame = pattern::render(&format).unwrap();
            let decoded = decode_frame(&frame, &offsets(&format), &format, 7).unwrap();
            assert_eq!(decoded.width(), 64, "{}", pixel_format);
            assert_eq!(decoded.height(), 16, "{}", pixel_format);
            assert_eq!(decoded.sequence, 7);

            if !pixel_format.is_compressed() {
                let left = decoded.image.get_pixel(2, 8).0;
                let right = decoded.image.get_pixel(61, 8).0;
                assert!(close_to(left, pattern::bar_color(2, 64)), "{} {:?}", pixel_format, left);
                assert!(close_to(right, pattern::bar_color(61, 64)), "{} {:?}", pixel_format, right);
            }
        }
    }

    #[test]
    fn test_odd_width_frames_decode() {
        for pixel_format in PixelFormat::ALL {
            if pixel_format.is_compressed() {
                continue;
            }
            let format = StreamFormat::new(pixel_format, 33, 17, 0);

            let flat = vec![128u8; format.frame_size()];
            let decoded = decode_frame(&flat, &offsets(&format), &format, 0).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (33, 17), "{}", pixel_format);

            let frame = pattern::render(&format).unwrap();
            assert_eq!(frame.len(), format.frame_size());
            let decoded = decode_frame(&frame, &offsets(&format), &format, 0).unwrap();
            let last = decoded.image.get_pixel(32, 16).0;
            assert!(close_to(last, pattern::bar_color(32, 33)), "{} {:?}", pixel_format, last);
        }
    }

    #[test]
    fn test_padded_stride_is_honoured() {
        let format = StreamFormat::new(PixelFormat::RGB888, 2, 2, 8);
        let data = [
            1, 2, 3, 4, 5, 6, 0, 0, //
            7, 8, 9, 10, 11, 12, 0, 0,
        ];
        let decoded = decode_frame(&data, &[0], &format, 0).unwrap();
        assert_eq!(decoded.image.as_raw(), &vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_bgr_is_swapped() {
        let format = StreamFormat::new(PixelFormat::BGR888, 1, 1, 0);
        let decoded = decode_frame(&[10, 20, 30], &[0], &format, 0).unwrap();
        assert_eq!(decoded.image.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_short_buffer_fails() {
        let format = StreamFormat::new(PixelFormat::I420, 16, 16, 0);
        let data = vec![0u8; format.frame_size() - 1];
        let err = decode_frame(&data, &offsets(&format), &format, 0).err().unwrap();
        assert!(matches!(err, FrameError::DecodeFailed(_)));
    }

    #[test]
    fn test_garbage_mjpeg_fails() {
        let format = StreamFormat::new(PixelFormat::MJPEG, 16, 16, 0);
        assert!(decode_frame(&[0u8; 64], &[0], &format, 0).is_err());
    }
}
