//! Shared frame, geometry and pixel types used across the pipeline.
//!
//! These are **internal** representations passed between pipeline stages.
//! The wire type sent to viewers is [`crate::channel::ScreenRegionPayload`].

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{DeskcastError, Result};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha (DXGI / GDI default).
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }

    /// Offsets of the red, green and blue channels within one pixel.
    pub(crate) const fn rgb_offsets(self) -> [usize; 3] {
        match self {
            PixelFormat::Bgra8 => [2, 1, 0],
            PixelFormat::Rgba8 | PixelFormat::Rgb8 => [0, 1, 2],
        }
    }
}

// ── Rect ─────────────────────────────────────────────────────────

/// A frame-local rectangle in pixels. `x + width` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// The empty rectangle.
    pub const EMPTY: Rect = Rect {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from exclusive edges. Inverted edges yield [`Rect::EMPTY`].
    pub fn from_edges(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        if right <= left || bottom <= top {
            return Rect::EMPTY;
        }
        Rect::new(left, top, right - left, bottom - top)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Smallest rectangle covering both. Empty operands are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => *other,
            (_, true) => *self,
            _ => Rect::from_edges(
                self.x.min(other.x),
                self.y.min(other.y),
                self.right().max(other.right()),
                self.bottom().max(other.bottom()),
            ),
        }
    }

    /// Overlapping area, or [`Rect::EMPTY`].
    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect::from_edges(
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        )
    }

    /// Grow by `amount` on every side, clamped to `bounds`.
    pub fn pad(&self, amount: u32, bounds: &Rect) -> Rect {
        if self.is_empty() {
            return Rect::EMPTY;
        }
        Rect::from_edges(
            self.x.saturating_sub(amount).max(bounds.x),
            self.y.saturating_sub(amount).max(bounds.y),
            self.right().saturating_add(amount).min(bounds.right()),
            self.bottom().saturating_add(amount).min(bounds.bottom()),
        )
    }

    /// Map a rect from an unrotated `source_width × source_height` surface
    /// into the surface produced by [`Frame::rotate`] with the same rotation.
    pub fn rotate(&self, rotation: Rotation, source_width: u32, source_height: u32) -> Rect {
        match rotation {
            Rotation::Identity => *self,
            // Content is turned counter-clockwise by a quarter.
            Rotation::Rotate90 => Rect::new(
                self.y,
                source_width.saturating_sub(self.right()),
                self.height,
                self.width,
            ),
            Rotation::Rotate180 => Rect::new(
                source_width.saturating_sub(self.right()),
                source_height.saturating_sub(self.bottom()),
                self.width,
                self.height,
            ),
            // Content is turned clockwise by a quarter.
            Rotation::Rotate270 => Rect::new(
                source_height.saturating_sub(self.bottom()),
                self.x,
                self.height,
                self.width,
            ),
        }
    }
}

// ── MonitorArea ──────────────────────────────────────────────────

/// A display's placement on the virtual desktop. `left`/`top` may be
/// negative for monitors positioned left of or above the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MonitorArea {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl MonitorArea {
    pub const fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub const fn right(&self) -> i64 {
        self.left as i64 + self.width as i64
    }

    pub const fn bottom(&self) -> i64 {
        self.top as i64 + self.height as i64
    }

    /// Smallest area covering both.
    pub fn union(&self, other: &MonitorArea) -> MonitorArea {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        MonitorArea::new(
            left,
            top,
            (right - left as i64).max(0) as u32,
            (bottom - top as i64).max(0) as u32,
        )
    }
}

// ── Rotation ─────────────────────────────────────────────────────

/// Rotation the OS reports for a display output. Captured frames from a
/// rotated output are turned back so the viewer sees the desktop upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

// ── Frame ────────────────────────────────────────────────────────

/// A raw, uncompressed screen capture.
///
/// The `data` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel` due to
/// GPU row-alignment requirements.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes** (may exceed `width * bpp`).
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Monotonic capture timestamp.
    pub timestamp: Instant,
}

impl Frame {
    /// Wrap a tightly- or loosely-packed buffer, validating its length.
    pub fn from_raw(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self> {
        let min_stride = width as usize * format.bytes_per_pixel();
        if (stride as usize) < min_stride {
            return Err(DeskcastError::Capture(format!(
                "stride {stride} shorter than row of {min_stride} bytes"
            )));
        }
        let needed = stride as usize * height as usize;
        if data.len() < needed {
            return Err(DeskcastError::Capture(format!(
                "frame buffer holds {} bytes, {needed} required",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            format,
            data,
            timestamp: Instant::now(),
        })
    }

    /// A tightly packed frame with every byte set to `fill`.
    pub fn filled(width: u32, height: u32, format: PixelFormat, fill: u8) -> Self {
        let stride = width * format.bytes_per_pixel() as u32;
        Self {
            width,
            height,
            stride,
            format,
            data: vec![fill; stride as usize * height as usize],
            timestamp: Instant::now(),
        }
    }

    /// Whole-frame rectangle.
    pub const fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Returns a row slice (including possible padding bytes).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.stride as usize]
    }

    /// Returns only the pixel bytes of row `y`, without padding.
    pub fn row_pixels(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &self.data[start..start + len]
    }

    /// Mutable pixel bytes of row `y`, without padding.
    pub fn row_pixels_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride as usize;
        let len = self.width as usize * self.format.bytes_per_pixel();
        &mut self.data[start..start + len]
    }

    /// Returns the pixel bytes at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride as usize + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }

    /// Mutable pixel bytes at `(x, y)`.
    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut [u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride as usize + x as usize * bpp;
        &mut self.data[offset..offset + bpp]
    }

    /// `true` when every pixel byte is zero. Some drivers hand back blank
    /// surfaces instead of failing.
    pub fn is_blank(&self) -> bool {
        (0..self.height).all(|y| self.row_pixels(y).iter().all(|&b| b == 0))
    }

    /// Copy `region` out as tightly packed RGB8.
    pub fn crop_to_rgb(&self, region: &Rect) -> Result<Vec<u8>> {
        let region = region.intersect(&self.bounds());
        if region.is_empty() {
            return Err(DeskcastError::RegionOutOfBounds(region));
        }
        let bpp = self.format.bytes_per_pixel();
        let [r, g, b] = self.format.rgb_offsets();
        let mut out = Vec::with_capacity(region.area() as usize * 3);

        for y in region.y..region.bottom() {
            let row = self.row_pixels(y);
            let start = region.x as usize * bpp;
            let end = region.right() as usize * bpp;
            for px in row[start..end].chunks_exact(bpp) {
                out.extend_from_slice(&[px[r], px[g], px[b]]);
            }
        }

        Ok(out)
    }

    /// Undo an output rotation, producing an upright, tightly packed frame.
    pub fn rotate(self, rotation: Rotation) -> Frame {
        if rotation == Rotation::Identity {
            return self;
        }
        let bpp = self.format.bytes_per_pixel();
        let (w, h) = (self.width as usize, self.height as usize);
        let (out_w, out_h) = match rotation {
            Rotation::Rotate90 | Rotation::Rotate270 => (h, w),
            _ => (w, h),
        };
        let out_stride = out_w * bpp;
        let mut out = vec![0u8; out_stride * out_h];

        for y in 0..h {
            let row = self.row_pixels(y as u32);
            for x in 0..w {
                let (dx, dy) = match rotation {
                    Rotation::Rotate90 => (y, w - 1 - x),
                    Rotation::Rotate180 => (w - 1 - x, h - 1 - y),
                    Rotation::Rotate270 => (h - 1 - y, x),
                    Rotation::Identity => (x, y),
                };
                let dst = dy * out_stride + dx * bpp;
                out[dst..dst + bpp].copy_from_slice(&row[x * bpp..(x + 1) * bpp]);
            }
        }

        Frame {
            width: out_w as u32,
            height: out_h as u32,
            stride: out_stride as u32,
            format: self.format,
            data: out,
            timestamp: self.timestamp,
        }
    }
}
