//! GDI `BitBlt` capture, the CPU fallback for DXGI.
//!
//! Slower than duplication and never reports dirty rects, but works on
//! the secure desktop, in RDP sessions and on drivers without
//! duplication support.

use std::mem::size_of;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Gdi::{
    BI_RGB, BITMAPINFO, BITMAPINFOHEADER, BitBlt, CAPTUREBLT, CreateCompatibleBitmap,
    CreateCompatibleDC, DIB_RGB_COLORS, DeleteDC, DeleteObject, GetDC, GetDIBits, HBITMAP, HDC,
    HGDIOBJ, ReleaseDC, SRCCOPY, SelectObject,
};

use crate::capture::{
    CaptureBackend, CaptureResult, CapturedFrame, CursorSource, composite_cursor,
};
use crate::display::DisplayInfo;
use crate::types::{Frame, PixelFormat};

// ── RAII guards ──────────────────────────────────────────────────

struct ScreenDc(HDC);

impl Drop for ScreenDc {
    fn drop(&mut self) {
        unsafe {
            ReleaseDC(HWND::default(), self.0);
        }
    }
}

struct MemoryDc(HDC);

impl Drop for MemoryDc {
    fn drop(&mut self) {
        unsafe {
            let _ = DeleteDC(self.0);
        }
    }
}

struct Bitmap(HBITMAP);

impl Drop for Bitmap {
    fn drop(&mut self) {
        unsafe {
            let _ = DeleteObject(HGDIOBJ(self.0.0));
        }
    }
}

/// Keeps a bitmap selected into a DC and restores the previous object.
struct Selection {
    dc: HDC,
    previous: HGDIOBJ,
}

impl Drop for Selection {
    fn drop(&mut self) {
        unsafe {
            SelectObject(self.dc, self.previous);
        }
    }
}

// ── GdiBackend ───────────────────────────────────────────────────

/// `BitBlt` screen grabber.
pub struct GdiBackend {
    cursor: Option<Arc<dyn CursorSource>>,
}

impl GdiBackend {
    pub fn new(cursor: Option<Arc<dyn CursorSource>>) -> Self {
        Self { cursor }
    }

    fn grab(&self, display: &DisplayInfo) -> Result<Frame, String> {
        let area = display.monitor_area;
        let (width, height) = (area.width as i32, area.height as i32);
        if width <= 0 || height <= 0 {
            return Err(format!("display {} has no area", display.device_name));
        }

        unsafe {
            let screen = ScreenDc(GetDC(HWND::default()));
            if screen.0.is_invalid() {
                return Err("GetDC failed".into());
            }
            let memory = MemoryDc(CreateCompatibleDC(screen.0));
            if memory.0.is_invalid() {
                return Err("CreateCompatibleDC failed".into());
            }
            let bitmap = Bitmap(CreateCompatibleBitmap(screen.0, width, height));
            if bitmap.0.is_invalid() {
                return Err("CreateCompatibleBitmap failed".into());
            }

            {
                let _selection = Selection {
                    dc: memory.0,
                    previous: SelectObject(memory.0, HGDIOBJ(bitmap.0.0)),
                };
                BitBlt(
                    memory.0,
                    0,
                    0,
                    width,
                    height,
                    screen.0,
                    area.left,
                    area.top,
                    SRCCOPY | CAPTUREBLT,
                )
                .map_err(|e| format!("BitBlt failed: {e}"))?;
            }

            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: width,
                    biHeight: -height, // top-down
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let stride = width as u32 * 4;
            let mut data = vec![0u8; stride as usize * height as usize];
            let lines = GetDIBits(
                memory.0,
                bitmap.0,
                0,
                height as u32,
                Some(data.as_mut_ptr().cast()),
                &mut info,
                DIB_RGB_COLORS,
            );
            if lines != height {
                return Err(format!("GetDIBits copied {lines} of {height} lines"));
            }

            Frame::from_raw(width as u32, height as u32, stride, PixelFormat::Bgra8, data)
                .map_err(|e| e.to_string())
        }
    }
}

#[async_trait]
impl CaptureBackend for GdiBackend {
    async fn capture(&mut self, display: &DisplayInfo, capture_cursor: bool) -> CaptureResult {
        let mut frame = match self.grab(display) {
            Ok(frame) => frame,
            Err(reason) => return CaptureResult::failed(reason),
        };

        if capture_cursor {
            if let Some(shape) = self.cursor.as_ref().and_then(|c| c.cursor()) {
                if composite_cursor(&mut frame, &shape, &display.monitor_area).is_none() {
                    debug!("cursor is outside the capture area");
                }
            }
        }

        CaptureResult::Captured(CapturedFrame::cpu(frame))
    }

    fn name(&self) -> &'static str {
        "gdi"
    }
}
