//! The capture loop.
//!
//! One task owns the backend and the baseline frame and cycles through:
//!
//! 1. **AwaitSlot**: reserve the single channel slot, then wait for the
//!    bandwidth gate. Both waits are cancellable.
//! 2. **AcquireDisplay**: the selected display, or the primary.
//! 3. **Capture**: one backend call.
//! 4. **Classify**: keyframe, delta, or nothing to send.
//! 5. **SendKeyframe / SendDelta**: encode into the reserved slot.
//!
//! The loop only ends on cancellation or when the frame consumer goes
//! away. Capture and encode failures are logged and retried.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bandwidth::{BandwidthController, MetricsSnapshot};
use crate::capture::{CaptureBackend, CaptureResult, CapturedFrame};
use crate::channel::{FrameSender, FrameSlot, FrameStream, ScreenRegionPayload, frame_channel};
use crate::config::PipelineConfig;
use crate::diff::{DirtyRegionEngine, union_dirty_rects};
use crate::display::{DisplayInfo, DisplayRegistry};
use crate::encoder::FrameEncoder;
use crate::error::{DeskcastError, Result};
use crate::types::{Frame, MonitorArea, Rect};

// ── KeyframeReason ───────────────────────────────────────────────

/// Why the next payload is a full frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeReason {
    /// Startup or an explicit [`PipelineHandle::request_keyframe`].
    Requested,
    /// Capture switched between the GPU and CPU paths.
    CaptureOriginChanged,
    /// A different display is selected.
    DisplayChanged,
    /// The selected display moved or was resized.
    BoundsChanged,
    /// The frame no longer matches the baseline's size or format.
    BaselineMismatch,
    /// Quality was reduced earlier and throughput has since recovered.
    QualityRefresh,
}

impl fmt::Display for KeyframeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyframeReason::Requested => "requested",
            KeyframeReason::CaptureOriginChanged => "capture origin changed",
            KeyframeReason::DisplayChanged => "display changed",
            KeyframeReason::BoundsChanged => "display bounds changed",
            KeyframeReason::BaselineMismatch => "baseline mismatch",
            KeyframeReason::QualityRefresh => "quality refresh",
        };
        f.write_str(s)
    }
}

// ── Internal state ───────────────────────────────────────────────

/// Display the last keyframe was sent for.
#[derive(Debug, Clone)]
struct KeyframeMark {
    device_name: String,
    area: MonitorArea,
}

/// The last frame handed to the viewer, owned outright.
#[derive(Debug)]
struct Baseline {
    frame: Frame,
    device_name: String,
}

/// What the loop does after one pass.
enum Step {
    Continue,
    Delay(Duration),
    Stop,
}

/// Outcome of classifying a capture.
enum Classified {
    Keyframe(KeyframeReason),
    Delta(Rect),
    Unchanged,
}

// ── CapturePipeline ──────────────────────────────────────────────

/// Capture → diff → encode → send loop for one viewer.
pub struct CapturePipeline<B = Box<dyn CaptureBackend>> {
    config: PipelineConfig,
    backend: B,
    displays: Arc<DisplayRegistry>,
    controller: Arc<BandwidthController>,
    encoder: FrameEncoder,
    engine: DirtyRegionEngine,
    sender: FrameSender,
    keyframe_requested: Arc<AtomicBool>,
    baseline: Option<Baseline>,
    last_keyframe: Option<KeyframeMark>,
    last_using_gpu: Option<bool>,
    needs_quality_refresh: bool,
    /// Controller reduction count when the last keyframe went out.
    reductions_at_keyframe: u64,
}

impl<B: CaptureBackend> CapturePipeline<B> {
    /// Build a pipeline and the stream its payloads arrive on.
    pub fn new(
        config: PipelineConfig,
        backend: B,
        displays: Arc<DisplayRegistry>,
    ) -> Result<(Self, FrameStream)> {
        config.validate()?;
        let (sender, stream) = frame_channel();
        let controller = Arc::new(BandwidthController::new(config.bandwidth.clone()));
        let pipeline = Self {
            encoder: FrameEncoder::new(config.codec),
            engine: DirtyRegionEngine::new(config.diff_padding),
            config,
            backend,
            displays,
            controller,
            sender,
            keyframe_requested: Arc::new(AtomicBool::new(true)),
            baseline: None,
            last_keyframe: None,
            last_using_gpu: None,
            needs_quality_refresh: false,
            reductions_at_keyframe: 0,
        };
        Ok((pipeline, stream))
    }

    /// A clonable control handle usable from any task.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            displays: Arc::clone(&self.displays),
            controller: Arc::clone(&self.controller),
            keyframe_requested: Arc::clone(&self.keyframe_requested),
        }
    }

    pub fn controller(&self) -> &Arc<BandwidthController> {
        &self.controller
    }

    /// Run the loop and the metrics timers on the current task until
    /// `cancel` fires or the frame stream is dropped.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let backend = self.backend.name();
        info!(backend, "capture pipeline started");
        self.controller.set_diagnostic("backend", backend);

        let timers_cancel = cancel.child_token();
        let timers = self.controller.start(timers_cancel.clone());

        loop {
            match self.step(&cancel).await {
                Step::Continue => {}
                Step::Delay(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Step::Stop => break,
            }
        }

        timers_cancel.cancel();
        if let Err(e) = timers.await {
            warn!("metrics task ended abnormally: {e}");
        }
        info!("capture pipeline stopped");
        Ok(())
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn start(mut self, cancel: CancellationToken) -> JoinHandle<Result<()>>
    where
        B: 'static,
    {
        tokio::spawn(async move { self.run(cancel).await })
    }

    // ── One pass ─────────────────────────────────────────────────

    async fn step(&mut self, cancel: &CancellationToken) -> Step {
        // AwaitSlot
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Stop,
            slot = self.sender.reserve() => match slot {
                Ok(slot) => slot,
                Err(_) => {
                    info!("frame consumer closed; stopping capture");
                    return Step::Stop;
                }
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Stop,
            gate = self.controller.wait_for_bandwidth() => {
                if gate.is_err() {
                    return Step::Stop;
                }
            }
        }

        self.controller.mark_iteration();

        // AcquireDisplay
        let Some(display) = self.displays.selected_or_primary() else {
            warn!("no display available to capture");
            return Step::Delay(self.config.failure_delay());
        };

        // Capture
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Stop,
            result = self.backend.capture(&display, self.config.capture.capture_cursor) => result,
        };

        let device = display.device_name.as_str();
        let captured = match result {
            CaptureResult::Captured(captured) => captured,
            CaptureResult::NoChanges => {
                if self.keyframe_requested.load(Ordering::Acquire) {
                    if let Some(step) = self.resend_baseline(&display, slot) {
                        return step;
                    }
                }
                return Step::Delay(self.config.no_change_delay());
            }
            CaptureResult::TimedOut => {
                debug!(device, "capture timed out");
                return Step::Delay(self.config.failure_delay());
            }
            CaptureResult::Failed(failure) => {
                warn!(
                    device,
                    gpu_fault = failure.gpu_fault,
                    "capture failed: {}",
                    failure.reason
                );
                self.displays.reload();
                self.baseline = None;
                self.keyframe_requested.store(true, Ordering::Release);
                return Step::Delay(self.config.failure_delay());
            }
        };

        self.send_captured(&display, captured, slot)
    }

    /// Classify a fresh capture and send whatever it calls for.
    fn send_captured(&mut self, display: &DisplayInfo, captured: CapturedFrame, slot: FrameSlot) -> Step {
        let origin_changed = self
            .last_using_gpu
            .is_some_and(|was_gpu| was_gpu != captured.is_using_gpu);
        if origin_changed {
            info!(gpu = captured.is_using_gpu, "capture origin switched");
        }
        self.last_using_gpu = Some(captured.is_using_gpu);
        self.controller.set_using_gpu(captured.is_using_gpu);

        let CapturedFrame {
            frame, dirty_rects, ..
        } = captured;

        let classified = match self.keyframe_reason(display, origin_changed) {
            Some(reason) => Classified::Keyframe(reason),
            None => self.classify_delta(display, &frame, dirty_rects.as_deref()),
        };

        match classified {
            Classified::Keyframe(reason) => self.send_keyframe(display, frame, reason, slot),
            Classified::Delta(region) => self.send_delta(display, frame, region, slot),
            Classified::Unchanged => {
                self.baseline = Some(Baseline {
                    frame,
                    device_name: display.device_name.clone(),
                });
                Step::Delay(self.config.no_change_delay())
            }
        }
    }

    fn keyframe_reason(&mut self, display: &DisplayInfo, origin_changed: bool) -> Option<KeyframeReason> {
        if self.keyframe_requested.load(Ordering::Acquire) {
            return Some(KeyframeReason::Requested);
        }
        if origin_changed {
            return Some(KeyframeReason::CaptureOriginChanged);
        }
        match &self.last_keyframe {
            None => return Some(KeyframeReason::Requested),
            Some(mark) if mark.device_name != display.device_name => {
                return Some(KeyframeReason::DisplayChanged);
            }
            Some(mark) if mark.area != display.monitor_area => {
                return Some(KeyframeReason::BoundsChanged);
            }
            Some(_) => {}
        }

        let bandwidth = self.controller.config();
        if self.needs_quality_refresh
            && self.controller.mbps() < bandwidth.target_mbps * self.config.quality_refresh_ratio
        {
            return Some(KeyframeReason::QualityRefresh);
        }
        self.track_quality_refresh();
        None
    }

    /// Arm a refresh only when quality has dropped since the last keyframe.
    fn track_quality_refresh(&mut self) {
        if self.controller.is_quality_reduced()
            && self.controller.quality_reductions() > self.reductions_at_keyframe
        {
            self.needs_quality_refresh = true;
        }
    }

    fn classify_delta(&self, display: &DisplayInfo, frame: &Frame, native: Option<&[Rect]>) -> Classified {
        let bounds = frame.bounds();
        let region = match native {
            Some(rects) => union_dirty_rects(rects, &bounds),
            None => {
                let previous = self
                    .baseline
                    .as_ref()
                    .filter(|b| b.device_name == display.device_name)
                    .map(|b| &b.frame);
                match self.engine.diff(frame, previous) {
                    Ok(region) => region,
                    Err(e @ (DeskcastError::DimensionMismatch { .. } | DeskcastError::PixelFormatMismatch)) => {
                        debug!("baseline unusable: {e}");
                        return Classified::Keyframe(KeyframeReason::BaselineMismatch);
                    }
                    Err(e) => {
                        warn!("diff failed, sending full frame: {e}");
                        bounds
                    }
                }
            }
        };

        if region.is_empty() {
            Classified::Unchanged
        } else {
            Classified::Delta(region)
        }
    }

    // ── Senders ──────────────────────────────────────────────────

    fn send_keyframe(&mut self, display: &DisplayInfo, frame: Frame, reason: KeyframeReason, slot: FrameSlot) -> Step {
        // Cleared before encoding so a request arriving meanwhile is kept.
        self.keyframe_requested.store(false, Ordering::Release);

        let region = frame.bounds();
        let data = match self.encoder.encode(&frame, &region, self.config.keyframe_quality) {
            Ok(data) => data,
            Err(e) => {
                error!(%reason, "keyframe encode failed: {e}");
                self.keyframe_requested.store(true, Ordering::Release);
                return Step::Continue;
            }
        };

        let device = display.device_name.as_str();
        debug!(
            %reason,
            device,
            width = region.width,
            height = region.height,
            bytes = data.len(),
            "sending keyframe"
        );
        slot.send(ScreenRegionPayload::new(region, true, data));
        self.controller.mark_frame_sent();

        if self
            .last_keyframe
            .as_ref()
            .is_none_or(|mark| mark.device_name != display.device_name || mark.area != display.monitor_area)
        {
            self.publish_display_diagnostics(display);
        }
        self.last_keyframe = Some(KeyframeMark {
            device_name: display.device_name.clone(),
            area: display.monitor_area,
        });
        self.needs_quality_refresh = false;
        self.reductions_at_keyframe = self.controller.quality_reductions();
        self.baseline = Some(Baseline {
            frame,
            device_name: display.device_name.clone(),
        });
        Step::Continue
    }

    fn send_delta(&mut self, display: &DisplayInfo, frame: Frame, region: Rect, slot: FrameSlot) -> Step {
        let quality = self.controller.quality();
        let data = match self.encoder.encode(&frame, &region, quality) {
            Ok(data) => data,
            Err(e) => {
                // Native dirty rects for this change are gone; resync with a full frame.
                error!(?region, "delta encode failed: {e}");
                self.keyframe_requested.store(true, Ordering::Release);
                return Step::Continue;
            }
        };

        let len = data.len();
        slot.send(ScreenRegionPayload::new(region, false, data));
        self.controller.mark_bytes_sent(len);
        self.controller.mark_frame_sent();

        self.baseline = Some(Baseline {
            frame,
            device_name: display.device_name.clone(),
        });
        Step::Continue
    }

    /// Answer a keyframe request while the screen is idle by re-encoding
    /// the baseline, if it belongs to `display`.
    fn resend_baseline(&mut self, display: &DisplayInfo, slot: FrameSlot) -> Option<Step> {
        let baseline = self
            .baseline
            .take_if(|b| b.device_name == display.device_name)?;
        Some(self.send_keyframe(display, baseline.frame, KeyframeReason::Requested, slot))
    }

    fn publish_display_diagnostics(&self, display: &DisplayInfo) {
        self.controller.set_diagnostic("display", display.device_name.clone());
        self.controller.set_diagnostic("display_name", display.display_name.clone());
        match serde_json::to_string(&display.monitor_area) {
            Ok(bounds) => self.controller.set_diagnostic("bounds", bounds),
            Err(e) => warn!("failed to serialise display bounds: {e}"),
        }
        if let Ok(virtual_bounds) = serde_json::to_string(&self.displays.virtual_bounds()) {
            self.controller.set_diagnostic("virtual_bounds", virtual_bounds);
        }
    }
}

impl<B> fmt::Debug for CapturePipeline<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("config", &self.config)
            .field("has_baseline", &self.baseline.is_some())
            .field("last_keyframe", &self.last_keyframe)
            .finish_non_exhaustive()
    }
}

// ── PipelineHandle ───────────────────────────────────────────────

/// External controls for a running [`CapturePipeline`].
#[derive(Clone)]
pub struct PipelineHandle {
    displays: Arc<DisplayRegistry>,
    controller: Arc<BandwidthController>,
    keyframe_requested: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Capture `device_name` from the next iteration on. The switch
    /// itself triggers a keyframe.
    pub fn select_display(&self, device_name: &str) -> Result<DisplayInfo> {
        let selected = self.displays.select(device_name)?;
        info!(device = device_name, "display selected");
        Ok(selected)
    }

    /// Send a full frame next.
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    pub fn displays(&self) -> Vec<DisplayInfo> {
        self.displays.displays()
    }

    pub fn selected_display(&self) -> Option<DisplayInfo> {
        self.displays.selected_or_primary()
    }

    /// Forward an OS display-configuration change.
    pub fn handle_display_settings_changed(&self) {
        self.displays.handle_display_settings_changed();
    }

    /// Map a viewer position (0.0–1.0 per axis) on the captured display to
    /// virtual-desktop coordinates.
    pub fn to_absolute(&self, percent_x: f64, percent_y: f64) -> Option<(i32, i32)> {
        self.displays
            .selected_or_primary()
            .map(|d| DisplayRegistry::to_absolute(&d, percent_x, percent_y))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.controller.snapshot()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.controller.subscribe()
    }

    pub fn controller(&self) -> &Arc<BandwidthController> {
        &self.controller
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("keyframe_requested", &self.keyframe_requested.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::display::{StaticDisplays, test_display};
    use crate::encoder::Codec;
    use crate::types::PixelFormat;

    /// Plays back a fixed list of results, then reports no changes.
    struct ScriptedBackend {
        script: Arc<Mutex<VecDeque<CaptureResult>>>,
    }

    #[async_trait]
    impl CaptureBackend for ScriptedBackend {
        async fn capture(&mut self, _display: &DisplayInfo, _cursor: bool) -> CaptureResult {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(CaptureResult::NoChanges)
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn frame(fill: u8) -> Frame {
        Frame::filled(32, 16, PixelFormat::Bgra8, fill)
    }

    fn cpu(frame: Frame) -> CaptureResult {
        CaptureResult::Captured(CapturedFrame::cpu(frame))
    }

    fn gpu(frame: Frame, rects: Vec<Rect>) -> CaptureResult {
        CaptureResult::Captured(CapturedFrame {
            frame,
            is_using_gpu: true,
            dirty_rects: Some(rects),
            gpu_timed_out: false,
        })
    }

    type Scripted = (CapturePipeline<ScriptedBackend>, FrameStream, Arc<Mutex<VecDeque<CaptureResult>>>);

    fn pipeline(results: Vec<CaptureResult>) -> Scripted {
        pipeline_with_codec(Codec::Zstd, results)
    }

    fn pipeline_with_codec(codec: Codec, results: Vec<CaptureResult>) -> Scripted {
        let script = Arc::new(Mutex::new(results.into()));
        let displays = Arc::new(DisplayRegistry::new(Arc::new(StaticDisplays::new(vec![
            test_display("D1", MonitorArea::new(0, 0, 32, 16), true),
            test_display("D2", MonitorArea::new(32, 0, 32, 16), false),
        ]))));
        let config = PipelineConfig {
            codec,
            ..Default::default()
        };
        let backend = ScriptedBackend {
            script: Arc::clone(&script),
        };
        let (p, rx) = CapturePipeline::new(config, backend, displays).unwrap();
        (p, rx, script)
    }

    /// Run passes until `n` payloads have been collected.
    async fn collect(p: &mut CapturePipeline<ScriptedBackend>, rx: &mut FrameStream, n: usize) -> Vec<ScreenRegionPayload> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        for _ in 0..64 {
            p.step(&cancel).await;
            while let Some(payload) = rx.try_recv() {
                out.push(payload);
            }
            if out.len() >= n {
                break;
            }
        }
        out
    }

    #[tokio::test]
    async fn first_frame_is_keyframe() {
        let (mut p, mut rx, _) = pipeline(vec![cpu(frame(1))]);
        let out = collect(&mut p, &mut rx, 1).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_keyframe);
        assert_eq!(out[0].region(), Rect::new(0, 0, 32, 16));
    }

    #[tokio::test]
    async fn identical_frame_sends_nothing() {
        let (mut p, mut rx, _) = pipeline(vec![cpu(frame(1)), cpu(frame(1))]);
        let cancel = CancellationToken::new();
        p.step(&cancel).await;
        assert!(rx.try_recv().unwrap().is_keyframe);
        assert!(matches!(p.step(&cancel).await, Step::Delay(_)));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn origin_switch_forces_one_keyframe() {
        let mut changed = frame(1);
        changed.pixel_mut(3, 3).copy_from_slice(&[9, 9, 9, 255]);
        let mut changed_again = changed.clone();
        changed_again.pixel_mut(20, 10).copy_from_slice(&[7, 7, 7, 255]);

        let (mut p, mut rx, _) = pipeline(vec![
            gpu(frame(1), vec![]),
            cpu(changed),
            cpu(changed_again),
        ]);
        let out = collect(&mut p, &mut rx, 3).await;
        let kinds: Vec<bool> = out.iter().map(|p| p.is_keyframe).collect();
        assert_eq!(kinds, vec![true, true, false]);
    }

    #[tokio::test]
    async fn display_switch_forces_keyframe() {
        let (mut p, mut rx, script) = pipeline(vec![cpu(frame(1))]);
        let handle = p.handle();
        collect(&mut p, &mut rx, 1).await;

        handle.select_display("D2").unwrap();
        script.lock().unwrap().extend([cpu(frame(1)), cpu(frame(2))]);
        let out = collect(&mut p, &mut rx, 2).await;
        assert!(out[0].is_keyframe);
        assert!(!out[1].is_keyframe);
        assert_eq!(p.controller().snapshot().extra.get("display").unwrap(), "D2");
    }

    #[tokio::test]
    async fn native_dirty_rects_are_used() {
        let (mut p, mut rx, _) = pipeline(vec![
            gpu(frame(1), vec![]),
            gpu(frame(1), vec![Rect::new(2, 2, 4, 4), Rect::new(10, 8, 2, 2), Rect::new(30, 14, 10, 10)]),
        ]);
        let out = collect(&mut p, &mut rx, 2).await;
        assert_eq!(out[1].region(), Rect::from_edges(2, 2, 32, 16));
        assert!(!out[1].is_keyframe);
    }

    #[tokio::test]
    async fn resized_frame_is_sent_as_keyframe() {
        let (mut p, mut rx, _) = pipeline(vec![
            cpu(frame(1)),
            cpu(Frame::filled(16, 16, PixelFormat::Bgra8, 1)),
        ]);
        let out = collect(&mut p, &mut rx, 2).await;
        assert!(out[1].is_keyframe);
        assert_eq!(out[1].width, 16);
    }

    #[tokio::test]
    async fn requested_keyframe_while_idle_resends_baseline() {
        let (mut p, mut rx, _) = pipeline(vec![cpu(frame(4))]);
        let handle = p.handle();
        collect(&mut p, &mut rx, 1).await;

        handle.request_keyframe();
        let out = collect(&mut p, &mut rx, 1).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_keyframe);
    }

    #[tokio::test]
    async fn failure_reloads_and_requests_keyframe() {
        let (mut p, mut rx, _) = pipeline(vec![
            cpu(frame(1)),
            CaptureResult::failed("device lost"),
            cpu(frame(1)),
        ]);
        let out = collect(&mut p, &mut rx, 2).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.is_keyframe));
    }

    #[tokio::test]
    async fn failed_delta_encode_requests_keyframe() {
        // JPEG cannot encode rows wider than 65535 pixels.
        let wide = Frame::filled(70_000, 1, PixelFormat::Bgra8, 3);
        let (mut p, mut rx, _) = pipeline_with_codec(
            Codec::Jpeg,
            vec![
                gpu(frame(1), vec![]),
                gpu(wide, vec![Rect::new(0, 0, 70_000, 1)]),
                gpu(frame(2), vec![Rect::new(0, 0, 4, 4)]),
            ],
        );
        let cancel = CancellationToken::new();
        p.step(&cancel).await;
        assert!(rx.try_recv().unwrap().is_keyframe);

        assert!(matches!(p.step(&cancel).await, Step::Continue));
        assert!(rx.try_recv().is_none());

        p.step(&cancel).await;
        let resync = rx.try_recv().unwrap();
        assert!(resync.is_keyframe);
        assert_eq!(resync.region(), Rect::new(0, 0, 32, 16));
    }

    /// Push a burst through the controller, then let it age out so quality
    /// sits just above the minimum with no measured throughput.
    async fn congest_then_idle(controller: &BandwidthController) {
        controller.mark_bytes_sent(50_000_000);
        controller.process_metrics();
        assert!(!controller.is_gate_open());
        tokio::time::advance(Duration::from_secs(4)).await;
        controller.process_metrics();
        assert!(controller.is_gate_open());
        assert_eq!(controller.mbps(), 0.0);
    }

    async fn keyframe_kinds(p: &mut CapturePipeline<ScriptedBackend>, rx: &mut FrameStream, passes: usize) -> Vec<bool> {
        let cancel = CancellationToken::new();
        let mut kinds = Vec::new();
        for _ in 0..passes {
            p.step(&cancel).await;
            kinds.extend(std::iter::from_fn(|| rx.try_recv()).map(|payload| payload.is_keyframe));
        }
        kinds
    }

    #[tokio::test(start_paused = true)]
    async fn quality_refresh_fires_once_per_reduction() {
        let (mut p, mut rx, script) = pipeline(vec![cpu(frame(1))]);
        let controller = Arc::clone(p.controller());
        assert_eq!(keyframe_kinds(&mut p, &mut rx, 1).await, vec![true]);

        congest_then_idle(&controller).await;
        assert_eq!(controller.quality(), 22);
        script.lock().unwrap().extend((2..14).map(|fill| cpu(frame(fill))));
        let kinds = keyframe_kinds(&mut p, &mut rx, 12).await;
        let mut expected = vec![false; 12];
        expected[1] = true;
        assert_eq!(kinds, expected);

        // A later drop arms exactly one more refresh.
        congest_then_idle(&controller).await;
        script.lock().unwrap().extend((20..26).map(|fill| cpu(frame(fill))));
        let kinds = keyframe_kinds(&mut p, &mut rx, 6).await;
        assert_eq!(kinds, vec![false, true, false, false, false, false]);
    }

    #[tokio::test]
    async fn closed_stream_stops_the_loop() {
        let (mut p, rx, _) = pipeline(vec![]);
        drop(rx);
        let cancel = CancellationToken::new();
        assert!(matches!(p.step(&cancel).await, Step::Stop));
    }

    #[tokio::test]
    async fn handle_maps_viewer_positions() {
        let (p, _rx, _) = pipeline(vec![]);
        let handle = p.handle();
        assert_eq!(handle.to_absolute(0.5, 0.5), Some((16, 8)));
        handle.select_display("D2").unwrap();
        assert_eq!(handle.to_absolute(0.0, 1.0), Some((32, 16)));
        assert!(handle.select_display("nope").is_err());
    }
}
