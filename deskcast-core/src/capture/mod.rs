//! Screen capture backends.
//!
//! A [`CaptureBackend`] turns "capture display X now" into a
//! [`CaptureResult`]. The pipeline calls it repeatedly (10 Hz and up)
//! from a single task and owns the returned frame outright.
//!
//! | Module      | Purpose                                                    |
//! |-------------|------------------------------------------------------------|
//! | `output`    | Native GPU output lifecycle and fault cache               |
//! | `gpu`       | GPU duplication backend with CPU fallback                 |
//! | `cursor`    | Cursor shape source and compositing                       |
//! | `synthetic` | Deterministic test-pattern backend for any platform       |

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CaptureConfig;
use crate::display::{DisplayInfo, DisplaySource};
use crate::error::Result;
use crate::types::{Frame, Rect};

pub mod cursor;
pub mod gpu;
pub mod output;
pub mod synthetic;

pub use cursor::{CursorShape, CursorSource, composite_cursor};
pub use gpu::GpuCaptureBackend;
pub use output::{
    AcquireError, AcquiredFrame, FaultCache, NativeOutput, OutputFactory, OutputHandle,
    OutputResource, OutputResourceManager,
};
pub use synthetic::{SyntheticBackend, synthetic_displays};

// ── CaptureResult ────────────────────────────────────────────────

/// A successfully captured frame.
#[derive(Debug)]
pub struct CapturedFrame {
    pub frame: Frame,
    /// `true` if the GPU path produced this frame.
    pub is_using_gpu: bool,
    /// Changed areas reported by the backend itself, if it tracks them.
    /// `None` means the caller has to diff.
    pub dirty_rects: Option<Vec<Rect>>,
    /// The GPU path timed out and this frame came from the fallback.
    pub gpu_timed_out: bool,
}

impl CapturedFrame {
    /// A CPU frame with no native dirty tracking.
    pub fn cpu(frame: Frame) -> Self {
        Self {
            frame,
            is_using_gpu: false,
            dirty_rects: None,
            gpu_timed_out: false,
        }
    }
}

/// Why a capture failed.
#[derive(Debug, Clone)]
pub struct CaptureFailure {
    pub reason: String,
    /// The failure came from a faulted GPU output.
    pub gpu_fault: bool,
}

/// Outcome of one [`CaptureBackend::capture`] call.
#[derive(Debug)]
pub enum CaptureResult {
    Captured(CapturedFrame),
    /// Nothing on screen changed since the previous capture.
    NoChanges,
    /// The backend waited and got nothing, and is not known to be healthy.
    TimedOut,
    Failed(CaptureFailure),
}

impl CaptureResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        CaptureResult::Failed(CaptureFailure {
            reason: reason.into(),
            gpu_fault: false,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CaptureResult::Captured(_))
    }

    pub fn had_no_changes(&self) -> bool {
        matches!(self, CaptureResult::NoChanges)
    }

    pub fn timed_out(&self) -> bool {
        match self {
            CaptureResult::TimedOut => true,
            CaptureResult::Captured(c) => c.gpu_timed_out,
            _ => false,
        }
    }

    pub fn is_using_gpu(&self) -> bool {
        matches!(self, CaptureResult::Captured(c) if c.is_using_gpu)
    }
}

// ── CaptureBackend ───────────────────────────────────────────────

/// A source of desktop frames.
#[async_trait]
pub trait CaptureBackend: Send {
    /// Capture `display` once. Never panics on platform errors; they come
    /// back as [`CaptureResult::Failed`].
    async fn capture(&mut self, display: &DisplayInfo, capture_cursor: bool) -> CaptureResult;

    /// Short name used in logs and diagnostics.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<B: CaptureBackend + ?Sized> CaptureBackend for Box<B> {
    async fn capture(&mut self, display: &DisplayInfo, capture_cursor: bool) -> CaptureResult {
        (**self).capture(display, capture_cursor).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

// ── Backend selection ────────────────────────────────────────────

/// Which backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// DXGI with GDI fallback on Windows, synthetic elsewhere.
    #[default]
    Auto,
    Dxgi,
    Gdi,
    Synthetic,
}

impl BackendKind {
    /// Resolve `Auto` for the current platform.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto if cfg!(target_os = "windows") => BackendKind::Dxgi,
            BackendKind::Auto => BackendKind::Synthetic,
            other => other,
        }
    }
}

/// Build the display source matching `kind`.
pub fn create_display_source(kind: BackendKind) -> Arc<dyn DisplaySource> {
    match kind.resolve() {
        BackendKind::Synthetic => Arc::new(synthetic_displays()),
        #[cfg(target_os = "windows")]
        _ => Arc::new(crate::platform::win32::WindowsDisplays),
        #[cfg(not(target_os = "windows"))]
        _ => Arc::new(synthetic_displays()),
    }
}

/// Build the capture backend matching `kind`.
pub fn create_backend(kind: BackendKind, config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>> {
    let resolved = kind.resolve();
    if kind == BackendKind::Auto {
        info!("auto-selected {resolved:?} capture backend");
    }
    match resolved {
        BackendKind::Synthetic => Ok(Box::new(SyntheticBackend::new())),
        native => native_backend(native, config),
    }
}

#[cfg(target_os = "windows")]
fn native_backend(kind: BackendKind, config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>> {
    use crate::platform::win32::{DxgiOutputFactory, GdiBackend, WindowsCursor};

    let cursor: Arc<dyn CursorSource> = Arc::new(WindowsCursor);
    match kind {
        BackendKind::Gdi => Ok(Box::new(GdiBackend::new(Some(cursor)))),
        _ => {
            let fallback = GdiBackend::new(Some(cursor.clone()));
            Ok(Box::new(
                GpuCaptureBackend::new(DxgiOutputFactory::new(), Box::new(fallback), config)
                    .with_cursor(cursor),
            ))
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn native_backend(kind: BackendKind, _config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>> {
    use crate::error::DeskcastError;

    tracing::warn!("{kind:?} capture is not available on this platform");
    Err(DeskcastError::BackendUnavailable(match kind {
        BackendKind::Gdi => "gdi",
        _ => "dxgi",
    }))
}
