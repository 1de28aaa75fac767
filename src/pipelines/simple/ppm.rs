// SPDX-License-Identifier: GPL-3.0-only

//! Binary PPM (P6) images
//!
//! `P6\n<W> <H> 255\n` followed by W×H×3 RGB bytes, nothing else.

use crate::storage;
use image::RgbImage;
use std::path::Path;

/// Serialize an RGB image as P6
pub fn encode_ppm(image: &RgbImage) -> Vec<u8> {
    let header = format!("P6\n{} {} 255\n", image.width(), image.height());
    let mut out = Vec::with_capacity(header.len() + image.as_raw().len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(image.as_raw());
    out
}

pub fn write_ppm(image: &RgbImage, path: &Path) -> std::io::Result<()> {
    storage::write_atomic(path, &encode_ppm(image))
}

/// Parse a P6 image with maxval 255
///
/// Comments are not supported; whitespace between header fields may be any
/// run of ASCII whitespace, and exactly one whitespace byte ends the header.
pub fn decode_ppm(data: &[u8]) -> Result<RgbImage, String> {
    let mut pos = 0;
    let mut fields = [0u32; 3];

    let magic = next_token(data, &mut pos).ok_or("missing magic number")?;
    if magic != b"P6" {
        return Err(format!(
            "not a binary PPM (magic {:?})",
            String::from_utf8_lossy(magic)
        ));
    }
    for (field, name) in fields.iter_mut().zip(["width", "height", "maxval"]) {
        let token = next_token(data, &mut pos).ok_or_else(|| format!("missing {}", name))?;
        *field = std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| format!("invalid {}", name))?;
    }
    let [width, height, maxval] = fields;
    if maxval != 255 {
        return Err(format!("unsupported maxval {}", maxval));
    }

    // Single whitespace byte after maxval
    pos += 1;
    let expected = width as usize * height as usize * 3;
    let pixels = data.get(pos..).unwrap_or_default();
    if pixels.len() != expected {
        return Err(format!(
            "pixel data is {} bytes, expected {}",
            pixels.len(),
            expected
        ));
    }
    RgbImage::from_raw(width, height, pixels.to_vec())
        .ok_or_else(|| "pixel data does not match dimensions".to_string())
}

pub fn read_ppm(path: &Path) -> Result<RgbImage, String> {
    let data = std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    decode_ppm(&data)
}

fn next_token<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    while *pos < data.len() && data[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    let start = *pos;
    while *pos < data.len() && !data[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    (*pos > start).then(|| &data[start..*pos])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_exact() {
        let image = RgbImage::from_pixel(3, 2, image::Rgb([1, 2, 3]));
        let data = encode_ppm(&image);
        assert!(data.starts_with(b"P6\n3 2 255\n"));
        assert_eq!(data.len(), b"P6\n3 2 255\n".len() + 3 * 2 * 3);
    }

    #[test]
    fn test_decode_rejects_short_data() {
        let err = decode_ppm(b"P6\n2 2 255\n\x00\x00").unwrap_err();
        assert!(err.contains("expected 12"));
    }

    #[test]
    fn test_decode_rejects_other_magic() {
        assert!(decode_ppm(b"P3\n1 1 255\n0 0 0").is_err());
        assert!(decode_ppm(b"").is_err());
    }
}
