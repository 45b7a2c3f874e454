//! Deterministic test-pattern capture.
//!
//! Renders a static gradient with a block that moves a fixed step every
//! capture. Works on every platform, so the agent and the pipeline can
//! run without a real desktop.

use async_trait::async_trait;

use crate::capture::{CaptureBackend, CaptureResult, CapturedFrame};
use crate::display::{DisplayInfo, StaticDisplays};
use crate::types::{Frame, MonitorArea, PixelFormat};

const BLOCK_SIZE: u32 = 64;
const STEP: u32 = 8;

/// Moving-block pattern generator.
pub struct SyntheticBackend {
    captures: u64,
    background: Option<Frame>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            captures: 0,
            background: None,
        }
    }

    /// Number of frames produced so far.
    pub fn captures(&self) -> u64 {
        self.captures
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    async fn capture(&mut self, display: &DisplayInfo, _capture_cursor: bool) -> CaptureResult {
        let MonitorArea { width, height, .. } = display.monitor_area;
        if width == 0 || height == 0 {
            return CaptureResult::failed(format!("display {} has no area", display.device_name));
        }

        let background = match self.background.take() {
            Some(bg) if bg.width == width && bg.height == height => bg,
            _ => render_background(width, height),
        };
        let mut frame = background.clone();
        frame.timestamp = std::time::Instant::now();
        self.background = Some(background);

        let step = self.captures;

        let block_w = BLOCK_SIZE.min(width);
        let block_h = BLOCK_SIZE.min(height);
        let span_x = (width - block_w + 1) as u64;
        let span_y = (height - block_h + 1) as u64;
        let left = (step * STEP as u64 % span_x) as u32;
        let top = (step * STEP as u64 / span_x % span_y) as u32;

        for y in top..top + block_h {
            let row = frame.row_pixels_mut(y);
            for px in row[left as usize * 4..(left + block_w) as usize * 4].chunks_exact_mut(4) {
                px.copy_from_slice(&[0xF0, 0xF0, 0xF0, 0xFF]);
            }
        }

        self.captures += 1;
        CaptureResult::Captured(CapturedFrame::cpu(frame))
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

fn render_background(width: u32, height: u32) -> Frame {
    let mut bg = Frame::filled(width, height, PixelFormat::Bgra8, 0xFF);
    for y in 0..height {
        for (x, px) in bg.row_pixels_mut(y).chunks_exact_mut(4).enumerate() {
            px[0] = (x as u32 * 255 / width) as u8;
            px[1] = (y * 255 / height) as u8;
            px[2] = 0x30;
        }
    }
    bg
}

/// Display source with a single 1920×1080 primary display.
pub fn synthetic_displays() -> StaticDisplays {
    StaticDisplays::new(vec![DisplayInfo {
        device_name: "SYNTHETIC1".to_string(),
        display_name: "Synthetic Display".to_string(),
        monitor_area: MonitorArea::new(0, 0, 1920, 1080),
        is_primary: true,
        scale_factor: 1.0,
    }])
}
