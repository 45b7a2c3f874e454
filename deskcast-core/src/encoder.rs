//! Region encoder.
//!
//! Crops a rectangle out of a captured [`Frame`], converts it to packed
//! RGB and compresses it:
//!
//! - **Jpeg**: lossy, `quality` is the JPEG quality (1–100).
//! - **Zstd**: lossless, `quality` picks the compression level; lower
//!   quality means harder compression and smaller payloads.
//!
//! Every buffer is scoped to the call; nothing is retained between
//! frames.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::error::{DeskcastError, Result};
use crate::types::{Frame, Rect};

/// Compression used for region payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Jpeg,
    Zstd,
}

// ── FrameEncoder ─────────────────────────────────────────────────

/// Stateless region encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder {
    codec: Codec,
}

impl FrameEncoder {
    pub fn new(codec: Codec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Encode `region` of `frame`. The region is clamped to the frame
    /// first; an empty intersection is an error.
    pub fn encode(&self, frame: &Frame, region: &Rect, quality: u8) -> Result<Vec<u8>> {
        let region = region.intersect(&frame.bounds());
        if region.is_empty() {
            return Err(DeskcastError::RegionOutOfBounds(region));
        }
        let rgb = frame.crop_to_rgb(&region)?;
        let quality = quality.clamp(1, 100);

        match self.codec {
            Codec::Jpeg => {
                let mut out = Vec::with_capacity(rgb.len() / 8);
                JpegEncoder::new_with_quality(&mut out, quality).encode(
                    &rgb,
                    region.width,
                    region.height,
                    ExtendedColorType::Rgb8,
                )?;
                Ok(out)
            }
            Codec::Zstd => zstd::encode_all(rgb.as_slice(), zstd_level(quality))
                .map_err(|e| DeskcastError::Encoding(format!("zstd encode failed: {e}"))),
        }
    }
}

/// Map quality 100 → level 1 (fast), quality 1 → level 19.
fn zstd_level(quality: u8) -> i32 {
    1 + (100 - quality as i32) * 18 / 99
}

/// Decode a region payload back to packed RGB.
pub fn decode_region(codec: Codec, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let rgb = match codec {
        Codec::Jpeg => image::load_from_memory_with_format(data, ImageFormat::Jpeg)?
            .to_rgb8()
            .into_raw(),
        Codec::Zstd => zstd::decode_all(data)
            .map_err(|e| DeskcastError::Encoding(format!("zstd decode failed: {e}")))?,
    };
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(DeskcastError::Encoding(format!(
            "decoded {} bytes, expected {expected} for {width}x{height}",
            rgb.len()
        )));
    }
    Ok(rgb)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn noisy_frame(w: u32, h: u32) -> Frame {
        let mut f = Frame::filled(w, h, PixelFormat::Bgra8, 0xFF);
        let mut seed = 0x1234_5678u32;
        for y in 0..h {
            for px in f.row_pixels_mut(y).chunks_exact_mut(4) {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                px[0] = (seed >> 16) as u8;
                px[1] = (seed >> 8) as u8;
                px[2] = seed as u8;
            }
        }
        f
    }

    #[test]
    fn jpeg_output_is_a_jpeg() {
        let enc = FrameEncoder::new(Codec::Jpeg);
        let frame = Frame::filled(64, 32, PixelFormat::Bgra8, 0x80);
        let data = enc.encode(&frame, &frame.bounds(), 75).unwrap();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        assert_eq!(decode_region(Codec::Jpeg, &data, 64, 32).unwrap().len(), 64 * 32 * 3);
    }

    #[test]
    fn lower_quality_is_smaller() {
        let enc = FrameEncoder::new(Codec::Jpeg);
        let frame = noisy_frame(128, 128);
        let high = enc.encode(&frame, &frame.bounds(), 95).unwrap();
        let low = enc.encode(&frame, &frame.bounds(), 20).unwrap();
        assert!(low.len() < high.len(), "{} !< {}", low.len(), high.len());
    }

    #[test]
    fn region_is_clamped_to_frame() {
        let enc = FrameEncoder::new(Codec::Zstd);
        let frame = noisy_frame(16, 16);
        let data = enc.encode(&frame, &Rect::new(8, 8, 100, 100), 50).unwrap();
        let rgb = decode_region(Codec::Zstd, &data, 8, 8).unwrap();
        assert_eq!(rgb, frame.crop_to_rgb(&Rect::new(8, 8, 8, 8)).unwrap());
    }

    #[test]
    fn region_outside_frame_fails() {
        let enc = FrameEncoder::default();
        let frame = noisy_frame(16, 16);
        assert!(matches!(
            enc.encode(&frame, &Rect::new(20, 20, 4, 4), 50),
            Err(DeskcastError::RegionOutOfBounds(_))
        ));
    }

    #[test]
    fn zstd_levels_span_range() {
        assert_eq!(zstd_level(100), 1);
        assert_eq!(zstd_level(1), 19);
        assert!(zstd_level(75) < zstd_level(20));
    }

    #[test]
    fn decode_rejects_wrong_size() {
        let enc = FrameEncoder::new(Codec::Zstd);
        let frame = noisy_frame(4, 4);
        let data = enc.encode(&frame, &frame.bounds(), 50).unwrap();
        assert!(decode_region(Codec::Zstd, &data, 5, 4).is_err());
    }
}
