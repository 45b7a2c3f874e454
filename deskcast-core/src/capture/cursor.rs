//! Mouse cursor compositing.
//!
//! Neither DXGI duplication nor `BitBlt` include the hardware cursor in
//! the captured image, so backends draw it themselves.

use crate::types::{Frame, MonitorArea, PixelFormat, Rect};

/// A cursor image and where it sits on the desktop.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorShape {
    /// Pointer position in virtual-desktop coordinates.
    pub x: i32,
    pub y: i32,
    /// Offset of the pointer tip inside the image.
    pub hotspot_x: u32,
    pub hotspot_y: u32,
    pub width: u32,
    pub height: u32,
    /// Tightly packed BGRA, straight alpha.
    pub pixels: Vec<u8>,
}

/// Platform hook returning the visible cursor, if any.
pub trait CursorSource: Send + Sync {
    fn cursor(&self) -> Option<CursorShape>;
}

/// Alpha-blend `cursor` into `frame`, which shows `area` of the desktop.
///
/// Returns the frame-local rect that was drawn, or `None` if the cursor
/// is not wholly inside the frame.
pub fn composite_cursor(frame: &mut Frame, cursor: &CursorShape, area: &MonitorArea) -> Option<Rect> {
    if cursor.width == 0 || cursor.height == 0 {
        return None;
    }
    if cursor.pixels.len() < cursor.width as usize * cursor.height as usize * 4 {
        return None;
    }

    let left = cursor.x as i64 - area.left as i64 - cursor.hotspot_x as i64;
    let top = cursor.y as i64 - area.top as i64 - cursor.hotspot_y as i64;
    if left < 0
        || top < 0
        || left + cursor.width as i64 > frame.width as i64
        || top + cursor.height as i64 > frame.height as i64
    {
        return None;
    }

    let target = Rect::new(left as u32, top as u32, cursor.width, cursor.height);
    let bpp = frame.format.bytes_per_pixel();
    let [r, g, b] = frame.format.rgb_offsets();
    let has_alpha = frame.format != PixelFormat::Rgb8;

    for row in 0..cursor.height {
        let src_row = &cursor.pixels[(row * cursor.width * 4) as usize..][..(cursor.width * 4) as usize];
        let dst_row = frame.row_pixels_mut(target.y + row);
        for (col, src) in src_row.chunks_exact(4).enumerate() {
            let alpha = src[3] as u32;
            if alpha == 0 {
                continue;
            }
            let offset = (target.x as usize + col) * bpp;
            let dst = &mut dst_row[offset..offset + bpp];
            // Source is BGRA: index 2 is red, 0 is blue.
            for (dst_idx, src_val) in [(r, src[2]), (g, src[1]), (b, src[0])] {
                dst[dst_idx] = blend(src_val, dst[dst_idx], alpha);
            }
            if has_alpha {
                dst[3] = 0xFF;
            }
        }
    }

    Some(target)
}

fn blend(src: u8, dst: u8, alpha: u32) -> u8 {
    ((src as u32 * alpha + dst as u32 * (255 - alpha)) / 255) as u8
}
