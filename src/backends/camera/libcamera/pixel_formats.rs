// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format mapping between libcamera DRM fourcc and internal PixelFormat types.

use crate::backends::camera::types::{PixelFormat, StreamRole};
use drm_fourcc::DrmFourcc;
use libcamera::pixel_format::PixelFormat as LcPixelFormat;
use tracing::debug;

/// Map a libcamera pixel format to the layouts the decoder understands
///
/// DRM fourcc names describe MSB-to-LSB bit order in a 32-bit word.
/// On little-endian (ARM, x86), the memory byte order is reversed:
///   DRM BGR888 → memory R,G,B → PixelFormat::RGB888
///   DRM RGB888 → memory B,G,R → PixelFormat::BGR888
pub(crate) fn from_libcamera(pf: LcPixelFormat) -> Option<PixelFormat> {
    if pf.fourcc() == libcamera::formats::MJPEG.fourcc() {
        return Some(PixelFormat::MJPEG);
    }
    match DrmFourcc::try_from(pf.fourcc()) {
        Ok(DrmFourcc::Yuv420) => Some(PixelFormat::I420),
        Ok(DrmFourcc::Nv12) => Some(PixelFormat::NV12),
        Ok(DrmFourcc::Nv21) => Some(PixelFormat::NV21),
        Ok(DrmFourcc::Yuyv) => Some(PixelFormat::YUYV),
        Ok(DrmFourcc::Bgr888) => Some(PixelFormat::RGB888),
        Ok(DrmFourcc::Rgb888) => Some(PixelFormat::BGR888),
        _ => {
            debug!(
                fourcc = format!("0x{:08x}", pf.fourcc()),
                "Pixel format not supported by the decoder"
            );
            None
        }
    }
}

/// libcamera pixel format for one of our layouts
pub(crate) fn to_libcamera(format: PixelFormat) -> LcPixelFormat {
    let drm = match format {
        PixelFormat::I420 => DrmFourcc::Yuv420,
        PixelFormat::NV12 => DrmFourcc::Nv12,
        PixelFormat::NV21 => DrmFourcc::Nv21,
        PixelFormat::YUYV => DrmFourcc::Yuyv,
        PixelFormat::RGB888 => DrmFourcc::Bgr888,
        PixelFormat::BGR888 => DrmFourcc::Rgb888,
        PixelFormat::MJPEG => return libcamera::formats::MJPEG,
    };
    LcPixelFormat::new(drm as u32, 0)
}

/// Human-readable name for logs
pub(crate) fn format_name(pf: LcPixelFormat) -> String {
    if let Some(info) = pf.info() {
        return info.name.clone();
    }
    if let Ok(drm) = DrmFourcc::try_from(pf.fourcc()) {
        return format!("{:?}", drm);
    }
    let bytes = pf.fourcc().to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic()) {
        return bytes.iter().map(|&b| b as char).collect();
    }
    format!("0x{:08x}", pf.fourcc())
}

pub(crate) fn stream_role(role: StreamRole) -> libcamera::stream::StreamRole {
    match role {
        StreamRole::StillCapture => libcamera::stream::StreamRole::StillCapture,
        StreamRole::ViewFinder => libcamera::stream::StreamRole::ViewFinder,
        StreamRole::VideoRecording => libcamera::stream::StreamRole::VideoRecording,
        StreamRole::Raw => libcamera::stream::StreamRole::Raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_layout_maps_back() {
        for format in PixelFormat::ALL {
            assert_eq!(from_libcamera(to_libcamera(format)), Some(format));
        }
    }

    #[test]
    fn test_packed_rgb_uses_memory_order() {
        assert_eq!(
            to_libcamera(PixelFormat::RGB888).fourcc(),
            DrmFourcc::Bgr888 as u32
        );
    }
}
