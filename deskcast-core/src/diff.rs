//! Dirty-region detection between consecutive frames.
//!
//! Compares the current frame against the retained baseline pixel by
//! pixel and returns the bounding box of everything that changed,
//! padded by a couple of pixels so lossy compression does not leave
//! seams at the region edges.
//!
//! This is `O(width × height)` per call, which is why backend-native
//! dirty rects (DXGI) are preferred whenever they are available.

use crate::error::{DeskcastError, Result};
use crate::types::{Frame, Rect};

/// Default padding, in pixels, added around a detected change.
pub const DEFAULT_PADDING: u32 = 2;

// ── DirtyRegionEngine ────────────────────────────────────────────

/// Stateless bounding-box differ.
#[derive(Debug, Clone, Copy)]
pub struct DirtyRegionEngine {
    padding: u32,
}

impl Default for DirtyRegionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_PADDING)
    }
}

impl DirtyRegionEngine {
    pub fn new(padding: u32) -> Self {
        Self { padding }
    }

    /// Changed area of `current` relative to `previous`.
    ///
    /// - no `previous` → the full frame.
    /// - different dimensions or pixel format → error; the caller must
    ///   fall back to sending a full frame.
    /// - identical pixels → [`Rect::EMPTY`].
    pub fn diff(&self, current: &Frame, previous: Option<&Frame>) -> Result<Rect> {
        let Some(previous) = previous else {
            return Ok(current.bounds());
        };

        if current.width != previous.width || current.height != previous.height {
            return Err(DeskcastError::DimensionMismatch {
                current: (current.width, current.height),
                previous: (previous.width, previous.height),
            });
        }
        if current.format != previous.format {
            return Err(DeskcastError::PixelFormatMismatch);
        }

        let bpp = current.format.bytes_per_pixel();
        let mut bbox: Option<(u32, u32, u32, u32)> = None;

        for y in 0..current.height {
            let cur_row = current.row_pixels(y);
            let prev_row = previous.row_pixels(y);

            // Unchanged rows are the common case on a mostly static desktop.
            if cur_row == prev_row {
                continue;
            }

            let Some(first) = Self::first_diff(cur_row, prev_row, bpp) else {
                continue;
            };
            let last = Self::last_diff(cur_row, prev_row, bpp).unwrap_or(first);

            bbox = Some(match bbox {
                None => (first, y, last, y),
                Some((left, top, right, _)) => (left.min(first), top, right.max(last), y),
            });
        }

        let Some((left, top, right, bottom)) = bbox else {
            return Ok(Rect::EMPTY);
        };

        let changed = Rect::from_edges(left, top, right + 1, bottom + 1);
        Ok(changed.pad(self.padding, &current.bounds()))
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Column of the first differing pixel in a row.
    fn first_diff(cur: &[u8], prev: &[u8], bpp: usize) -> Option<u32> {
        cur.chunks_exact(bpp)
            .zip(prev.chunks_exact(bpp))
            .position(|(a, b)| a != b)
            .map(|x| x as u32)
    }

    /// Column of the last differing pixel in a row.
    fn last_diff(cur: &[u8], prev: &[u8], bpp: usize) -> Option<u32> {
        let pixels = cur.len() / bpp;
        cur.chunks_exact(bpp)
            .rev()
            .zip(prev.chunks_exact(bpp).rev())
            .position(|(a, b)| a != b)
            .map(|from_end| (pixels - 1 - from_end) as u32)
    }
}

/// Union of backend-supplied dirty rects, clipped to `bounds`.
pub fn union_dirty_rects(rects: &[Rect], bounds: &Rect) -> Rect {
    rects
        .iter()
        .filter(|r| !r.is_empty())
        .fold(Rect::EMPTY, |acc, r| acc.union(r))
        .intersect(bounds)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn make_frame(w: u32, h: u32, fill: u8) -> Frame {
        Frame::filled(w, h, PixelFormat::Bgra8, fill)
    }

    fn paint(frame: &mut Frame, area: Rect, value: u8) {
        for y in area.y..area.bottom() {
            for x in area.x..area.right() {
                frame.pixel_mut(x, y)[1] = value;
            }
        }
    }

    #[test]
    fn no_previous_frame_is_full() {
        let engine = DirtyRegionEngine::default();
        let frame = make_frame(128, 64, 0);
        assert_eq!(engine.diff(&frame, None).unwrap(), Rect::new(0, 0, 128, 64));
    }

    #[test]
    fn identical_frame_has_no_changes() {
        let engine = DirtyRegionEngine::default();
        let frame = make_frame(128, 128, 0xAA);
        assert!(engine.diff(&frame, Some(&frame)).unwrap().is_empty());
    }

    #[test]
    fn single_pixel_change_is_padded() {
        let engine = DirtyRegionEngine::default();
        let previous = make_frame(64, 64, 0);
        let mut current = previous.clone();
        current.pixel_mut(20, 30)[0] = 0xFF;

        let rect = engine.diff(&current, Some(&previous)).unwrap();
        assert_eq!(rect, Rect::new(18, 28, 5, 5));
    }

    #[test]
    fn block_change_bounding_box() {
        let engine = DirtyRegionEngine::default();
        let previous = make_frame(1920, 1080, 0);
        let mut current = previous.clone();
        paint(&mut current, Rect::new(10, 10, 100, 50), 0x7F);

        let rect = engine.diff(&current, Some(&previous)).unwrap();
        assert_eq!(rect, Rect::from_edges(8, 8, 112, 62));
    }

    #[test]
    fn scattered_changes_cover_all() {
        let engine = DirtyRegionEngine::new(0);
        let previous = make_frame(100, 100, 0);
        let mut current = previous.clone();
        current.pixel_mut(5, 90)[2] = 1;
        current.pixel_mut(80, 3)[2] = 1;

        let rect = engine.diff(&current, Some(&previous)).unwrap();
        assert_eq!(rect, Rect::from_edges(5, 3, 81, 91));
    }

    #[test]
    fn padding_clamps_at_frame_edges() {
        let engine = DirtyRegionEngine::default();
        let previous = make_frame(16, 16, 0);
        let mut current = previous.clone();
        current.pixel_mut(0, 0)[0] = 1;
        current.pixel_mut(15, 15)[0] = 1;

        assert_eq!(
            engine.diff(&current, Some(&previous)).unwrap(),
            Rect::new(0, 0, 16, 16)
        );
    }

    #[test]
    fn stride_padding_is_ignored() {
        let engine = DirtyRegionEngine::default();
        // 4 px wide, rows padded to 32 bytes.
        let a = Frame::from_raw(4, 2, 32, PixelFormat::Bgra8, vec![0; 64]).unwrap();
        let mut data = vec![0; 64];
        data[20] = 0xFF; // padding byte of row 0
        data[63] = 0xFF; // padding byte of row 1
        let b = Frame::from_raw(4, 2, 32, PixelFormat::Bgra8, data).unwrap();

        assert!(engine.diff(&b, Some(&a)).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_fails() {
        let engine = DirtyRegionEngine::default();
        let a = make_frame(64, 64, 0);
        let b = make_frame(32, 64, 0);
        assert!(matches!(
            engine.diff(&a, Some(&b)),
            Err(DeskcastError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn format_mismatch_fails() {
        let engine = DirtyRegionEngine::default();
        let a = make_frame(8, 8, 0);
        let b = Frame::filled(8, 8, PixelFormat::Rgba8, 0);
        assert!(matches!(
            engine.diff(&a, Some(&b)),
            Err(DeskcastError::PixelFormatMismatch)
        ));
    }

    #[test]
    fn union_of_native_rects_is_clipped() {
        let bounds = Rect::new(0, 0, 100, 100);
        let rects = [Rect::new(10, 10, 5, 5), Rect::EMPTY, Rect::new(90, 90, 50, 50)];
        assert_eq!(union_dirty_rects(&rects, &bounds), Rect::from_edges(10, 10, 100, 100));
        assert!(union_dirty_rects(&[], &bounds).is_empty());
    }
}
