//! GPU desktop-duplication backend with CPU fallback.
//!
//! Flow per capture:
//!
//! 1. Get the output for the display from [`OutputResourceManager`].
//!    Fault-cached or uncreatable ⇒ fallback backend.
//! 2. Acquire with a short timeout.
//!    - No new frame and the output is healthy ⇒ `NoChanges`.
//!    - No new frame and the output is not healthy ⇒ fallback, flagged
//!      `gpu_timed_out`.
//!    - Fault ⇒ recycle the output, report `Failed`.
//! 3. Rotate the frame upright, composite the cursor and report native
//!    dirty rects (plus old and new cursor areas).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::capture::cursor::{CursorSource, composite_cursor};
use crate::capture::output::{
    AcquireError, FaultCache, OutputFactory, OutputHandle, OutputResourceManager,
};
use crate::capture::{CaptureBackend, CaptureFailure, CaptureResult, CapturedFrame};
use crate::config::CaptureConfig;
use crate::display::DisplayInfo;

/// What the GPU path produced, before fallback is considered.
enum GpuOutcome {
    Frame(CapturedFrame),
    NoChanges,
    TimedOut,
    Unavailable(&'static str),
    Faulted(String),
}

/// GPU capture backend.
pub struct GpuCaptureBackend<F: OutputFactory> {
    outputs: OutputResourceManager<F>,
    fallback: Box<dyn CaptureBackend>,
    cursor: Option<Arc<dyn CursorSource>>,
    timeout: Duration,
    health_window: Duration,
    allow_fallback: bool,
}

impl<F: OutputFactory> GpuCaptureBackend<F> {
    pub fn new(factory: F, fallback: Box<dyn CaptureBackend>, config: &CaptureConfig) -> Self {
        Self {
            outputs: OutputResourceManager::new(factory, config.fault_ttl()),
            fallback,
            cursor: None,
            timeout: config.gpu_timeout(),
            health_window: config.gpu_health_window(),
            allow_fallback: config.allow_cpu_fallback,
        }
    }

    pub fn with_cursor(mut self, cursor: Arc<dyn CursorSource>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn fault_cache(&self) -> Arc<FaultCache> {
        self.outputs.fault_cache()
    }

    /// Release the native output.
    pub fn shutdown(&mut self) {
        self.outputs.shutdown();
    }

    fn capture_gpu(&mut self, display: &DisplayInfo, capture_cursor: bool) -> GpuOutcome {
        let Some(resource) = self.outputs.get(&display.device_name) else {
            return GpuOutcome::Unavailable("gpu output unavailable");
        };

        let acquired = match resource.handle.acquire_frame(self.timeout) {
            Ok(acquired) => acquired,
            Err(AcquireError::Timeout) => {
                return if resource.is_healthy(self.health_window) {
                    GpuOutcome::NoChanges
                } else {
                    GpuOutcome::TimedOut
                };
            }
            Err(AcquireError::Fault(reason)) => {
                self.outputs.recycle();
                return GpuOutcome::Faulted(reason);
            }
        };

        let frame = match acquired.frame {
            Some(frame) if acquired.accumulated_frames > 0 => frame,
            _ => {
                return if resource.is_healthy(self.health_window) {
                    GpuOutcome::NoChanges
                } else {
                    GpuOutcome::TimedOut
                };
            }
        };

        if frame.is_blank() {
            return GpuOutcome::Unavailable("gpu returned a blank frame");
        }

        let (width, height) = (frame.width, frame.height);
        let rotation = resource.rotation;
        let mut dirty_rects: Vec<_> = acquired
            .dirty_rects
            .iter()
            .map(|r| r.rotate(rotation, width, height))
            .collect();
        let mut frame = frame.rotate(rotation);
        resource.last_successful_capture = Some(Instant::now());

        if capture_cursor {
            dirty_rects.extend(resource.last_cursor_area.take());
            resource.last_cursor_area = self
                .cursor
                .as_ref()
                .and_then(|source| source.cursor())
                .and_then(|shape| composite_cursor(&mut frame, &shape, &display.monitor_area));
            dirty_rects.extend(resource.last_cursor_area);
        }

        GpuOutcome::Frame(CapturedFrame {
            frame,
            is_using_gpu: true,
            dirty_rects: Some(dirty_rects),
            gpu_timed_out: false,
        })
    }

    async fn capture_fallback(
        &mut self,
        display: &DisplayInfo,
        capture_cursor: bool,
        gpu_timed_out: bool,
    ) -> CaptureResult {
        match self.fallback.capture(display, capture_cursor).await {
            CaptureResult::Captured(mut captured) => {
                captured.gpu_timed_out = gpu_timed_out;
                CaptureResult::Captured(captured)
            }
            other => other,
        }
    }
}

#[async_trait]
impl<F: OutputFactory> CaptureBackend for GpuCaptureBackend<F> {
    async fn capture(&mut self, display: &DisplayInfo, capture_cursor: bool) -> CaptureResult {
        let device = display.device_name.as_str();
        match self.capture_gpu(display, capture_cursor) {
            GpuOutcome::Frame(captured) => CaptureResult::Captured(captured),
            GpuOutcome::NoChanges => CaptureResult::NoChanges,
            GpuOutcome::TimedOut if self.allow_fallback => {
                debug!(device, "gpu capture timed out; using fallback");
                self.capture_fallback(display, capture_cursor, true).await
            }
            GpuOutcome::TimedOut => CaptureResult::TimedOut,
            GpuOutcome::Unavailable(reason) if self.allow_fallback => {
                debug!(device, "{reason}; using fallback");
                self.capture_fallback(display, capture_cursor, false).await
            }
            GpuOutcome::Unavailable(reason) => CaptureResult::failed(reason),
            GpuOutcome::Faulted(reason) => {
                warn!(device, "gpu output faulted: {reason}");
                CaptureResult::Failed(CaptureFailure {
                    reason,
                    gpu_fault: true,
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "dxgi"
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::output::{AcquiredFrame, NativeOutput, OutputHandle};
    use crate::capture::{CursorShape, synthetic::SyntheticBackend};
    use crate::display::test_display;
    use crate::error::Result;
    use crate::types::{Frame, MonitorArea, PixelFormat, Rect, Rotation};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Script = VecDeque<std::result::Result<AcquiredFrame, AcquireError>>;

    /// Factory whose handles pull from one shared script and count acquisitions.
    struct SharedScriptFactory {
        script: Arc<Mutex<Script>>,
        acquisitions: Arc<AtomicUsize>,
        rotation: Rotation,
    }

    struct SharedHandle {
        script: Arc<Mutex<Script>>,
        acquisitions: Arc<AtomicUsize>,
    }

    impl OutputHandle for SharedHandle {
        fn acquire_frame(
            &mut self,
            _timeout: Duration,
        ) -> std::result::Result<AcquiredFrame, AcquireError> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AcquireError::Timeout))
        }
    }

    impl OutputFactory for SharedScriptFactory {
        type Handle = SharedHandle;

        fn create(&mut self, _device_name: &str) -> Result<NativeOutput<SharedHandle>> {
            Ok(NativeOutput {
                handle: SharedHandle {
                    script: self.script.clone(),
                    acquisitions: self.acquisitions.clone(),
                },
                bounds: Rect::new(0, 0, 8, 4),
                rotation: self.rotation,
            })
        }
    }

    struct FixedCursor(CursorShape);

    impl CursorSource for FixedCursor {
        fn cursor(&self) -> Option<CursorShape> {
            Some(self.0.clone())
        }
    }

    fn gpu_frame(rects: Vec<Rect>) -> std::result::Result<AcquiredFrame, AcquireError> {
        Ok(AcquiredFrame {
            accumulated_frames: 1,
            frame: Some(Frame::filled(8, 4, PixelFormat::Bgra8, 0x40)),
            dirty_rects: rects,
        })
    }

    fn backend(
        script: Vec<std::result::Result<AcquiredFrame, AcquireError>>,
        rotation: Rotation,
    ) -> (GpuCaptureBackend<SharedScriptFactory>, Arc<AtomicUsize>) {
        let acquisitions = Arc::new(AtomicUsize::new(0));
        let factory = SharedScriptFactory {
            script: Arc::new(Mutex::new(script.into())),
            acquisitions: acquisitions.clone(),
            rotation,
        };
        let backend = GpuCaptureBackend::new(
            factory,
            Box::new(SyntheticBackend::new()),
            &CaptureConfig::default(),
        );
        (backend, acquisitions)
    }

    fn display() -> DisplayInfo {
        test_display("DISPLAY1", MonitorArea::new(0, 0, 8, 4), true)
    }

    #[tokio::test(start_paused = true)]
    async fn native_dirty_rects_pass_through() {
        let (mut gpu, _) = backend(vec![gpu_frame(vec![Rect::new(1, 1, 2, 2)])], Rotation::Identity);
        let CaptureResult::Captured(c) = gpu.capture(&display(), false).await else {
            panic!("expected a frame");
        };
        assert!(c.is_using_gpu);
        assert_eq!(c.dirty_rects, Some(vec![Rect::new(1, 1, 2, 2)]));
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_timeout_means_no_changes() {
        let (mut gpu, _) = backend(
            vec![gpu_frame(vec![]), Err(AcquireError::Timeout)],
            Rotation::Identity,
        );
        assert!(gpu.capture(&display(), false).await.is_success());
        assert!(gpu.capture(&display(), false).await.had_no_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_timeout_falls_back() {
        let (mut gpu, _) = backend(vec![Err(AcquireError::Timeout)], Rotation::Identity);
        let result = gpu.capture(&display(), false).await;
        assert!(result.timed_out());
        assert!(result.is_success());
        assert!(!result.is_using_gpu());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_accumulated_frames_after_idle_falls_back() {
        let (mut gpu, _) = backend(
            vec![
                gpu_frame(vec![]),
                Ok(AcquiredFrame {
                    accumulated_frames: 0,
                    frame: None,
                    dirty_rects: vec![],
                }),
            ],
            Rotation::Identity,
        );
        assert!(gpu.capture(&display(), false).await.is_using_gpu());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(gpu.capture(&display(), false).await.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn fault_recycles_and_skips_gpu_within_ttl() {
        let (mut gpu, acquisitions) = backend(
            vec![Err(AcquireError::Fault("device removed".into()))],
            Rotation::Identity,
        );

        let result = gpu.capture(&display(), false).await;
        assert!(matches!(result, CaptureResult::Failed(CaptureFailure { gpu_fault: true, .. })));
        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);

        for _ in 0..5 {
            let result = gpu.capture(&display(), false).await;
            assert!(result.is_success() && !result.is_using_gpu());
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
        assert!(gpu.fault_cache().contains("DISPLAY1"));

        tokio::time::advance(Duration::from_secs(6)).await;
        gpu.capture(&display(), false).await;
        assert_eq!(acquisitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_frame_falls_back() {
        let (mut gpu, _) = backend(
            vec![Ok(AcquiredFrame {
                accumulated_frames: 1,
                frame: Some(Frame::filled(8, 4, PixelFormat::Bgra8, 0)),
                dirty_rects: vec![],
            })],
            Rotation::Identity,
        );
        let result = gpu.capture(&display(), false).await;
        assert!(result.is_success() && !result.is_using_gpu());
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_applies_to_frame_and_rects() {
        let (mut gpu, _) = backend(vec![gpu_frame(vec![Rect::new(6, 1, 1, 1)])], Rotation::Rotate90);
        let display = test_display("DISPLAY1", MonitorArea::new(0, 0, 4, 8), true);
        let CaptureResult::Captured(c) = gpu.capture(&display, false).await else {
            panic!("expected a frame");
        };
        assert_eq!((c.frame.width, c.frame.height), (4, 8));
        assert_eq!(c.dirty_rects, Some(vec![Rect::new(6, 1, 1, 1).rotate(Rotation::Rotate90, 8, 4)]));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_areas_fold_into_dirty_rects() {
        let (gpu, _) = backend(
            vec![gpu_frame(vec![]), gpu_frame(vec![])],
            Rotation::Identity,
        );
        let cursor = CursorShape {
            x: 2,
            y: 1,
            hotspot_x: 0,
            hotspot_y: 0,
            width: 1,
            height: 1,
            pixels: vec![255, 255, 255, 255],
        };
        let mut gpu = gpu.with_cursor(Arc::new(FixedCursor(cursor)));

        let CaptureResult::Captured(first) = gpu.capture(&display(), true).await else {
            panic!("expected a frame");
        };
        assert_eq!(first.dirty_rects, Some(vec![Rect::new(2, 1, 1, 1)]));

        let CaptureResult::Captured(second) = gpu.capture(&display(), true).await else {
            panic!("expected a frame");
        };
        // Previous and current cursor areas.
        assert_eq!(second.dirty_rects, Some(vec![Rect::new(2, 1, 1, 1), Rect::new(2, 1, 1, 1)]));
    }
}
