//! Current cursor shape via `GetCursorInfo` + `GetIconInfo`.

use std::mem::size_of;

use windows::Win32::Graphics::Gdi::{
    BI_RGB, BITMAP, BITMAPINFO, BITMAPINFOHEADER, DIB_RGB_COLORS, DeleteObject, GetDC, GetDIBits,
    GetObjectW, HBITMAP, HGDIOBJ, ReleaseDC,
};
use windows::Win32::Foundation::HWND;
use windows::Win32::UI::WindowsAndMessaging::{
    CURSOR_SHOWING, CURSORINFO, GetCursorInfo, GetIconInfo, HICON, ICONINFO,
};

use crate::capture::{CursorShape, CursorSource};

/// Reads the system cursor.
#[derive(Debug, Default)]
pub struct WindowsCursor;

impl CursorSource for WindowsCursor {
    fn cursor(&self) -> Option<CursorShape> {
        unsafe {
            let mut ci = CURSORINFO {
                cbSize: size_of::<CURSORINFO>() as u32,
                ..Default::default()
            };
            GetCursorInfo(&mut ci).ok()?;
            if ci.flags.0 & CURSOR_SHOWING.0 == 0 {
                return None;
            }

            let mut icon = ICONINFO::default();
            GetIconInfo(HICON(ci.hCursor.0), &mut icon).ok()?;

            let mask = read_bitmap(icon.hbmMask);
            let color = if icon.hbmColor.is_invalid() {
                None
            } else {
                read_bitmap(icon.hbmColor)
            };
            let _ = DeleteObject(HGDIOBJ(icon.hbmMask.0));
            if !icon.hbmColor.is_invalid() {
                let _ = DeleteObject(HGDIOBJ(icon.hbmColor.0));
            }

            let (width, height, pixels) = match (color, mask) {
                (Some(color), Some(mask)) => apply_mask(color, &mask),
                // Monochrome cursor: AND mask on top, XOR mask below.
                (None, Some(mask)) => monochrome(mask)?,
                _ => return None,
            };

            Some(CursorShape {
                x: ci.ptScreenPos.x,
                y: ci.ptScreenPos.y,
                hotspot_x: icon.xHotspot,
                hotspot_y: icon.yHotspot,
                width,
                height,
                pixels,
            })
        }
    }
}

type Bits = (u32, u32, Vec<u8>);

/// Read any bitmap as top-down 32-bit BGRA.
unsafe fn read_bitmap(bitmap: HBITMAP) -> Option<Bits> {
    let mut bm = BITMAP::default();
    let got = unsafe {
        GetObjectW(
            HGDIOBJ(bitmap.0),
            size_of::<BITMAP>() as i32,
            Some((&mut bm as *mut BITMAP).cast()),
        )
    };
    if got == 0 || bm.bmWidth <= 0 || bm.bmHeight <= 0 {
        return None;
    }
    let (width, height) = (bm.bmWidth, bm.bmHeight);

    let mut info = BITMAPINFO {
        bmiHeader: BITMAPINFOHEADER {
            biSize: size_of::<BITMAPINFOHEADER>() as u32,
            biWidth: width,
            biHeight: -height,
            biPlanes: 1,
            biBitCount: 32,
            biCompression: BI_RGB.0,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut data = vec![0u8; width as usize * height as usize * 4];
    let lines = unsafe {
        let dc = GetDC(HWND::default());
        let lines = GetDIBits(
            dc,
            bitmap,
            0,
            height as u32,
            Some(data.as_mut_ptr().cast()),
            &mut info,
            DIB_RGB_COLORS,
        );
        ReleaseDC(HWND::default(), dc);
        lines
    };
    (lines == height).then_some((width as u32, height as u32, data))
}

/// Colour cursors without an alpha channel take transparency from the mask.
fn apply_mask((width, height, mut pixels): Bits, mask: &Bits) -> Bits {
    let has_alpha = pixels.chunks_exact(4).any(|px| px[3] != 0);
    if !has_alpha {
        for (px, m) in pixels.chunks_exact_mut(4).zip(mask.2.chunks_exact(4)) {
            px[3] = if m[0] == 0 { 0xFF } else { 0 };
        }
    }
    (width, height, pixels)
}

fn monochrome((width, double_height, mask): Bits) -> Option<Bits> {
    let height = double_height / 2;
    if height == 0 {
        return None;
    }
    let plane = (width * height * 4) as usize;
    let (and_plane, xor_plane) = mask.split_at(plane);
    let mut pixels = vec![0u8; plane];
    for ((px, a), x) in pixels
        .chunks_exact_mut(4)
        .zip(and_plane.chunks_exact(4))
        .zip(xor_plane.chunks_exact(4))
    {
        match (a[0] != 0, x[0] != 0) {
            (false, value) => {
                let v = if value { 0xFF } else { 0 };
                px.copy_from_slice(&[v, v, v, 0xFF]);
            }
            // Screen-inverting pixels are drawn black.
            (true, true) => px.copy_from_slice(&[0, 0, 0, 0xFF]),
            (true, false) => {}
        }
    }
    Some((width, height, pixels))
}
