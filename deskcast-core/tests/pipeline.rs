//! Integration tests: the full capture loop driven by scripted backends,
//! with tokio's paused clock standing in for real time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deskcast_core::capture::{
    AcquireError, AcquiredFrame, GpuCaptureBackend, NativeOutput, OutputFactory, OutputHandle,
};
use deskcast_core::{
    CaptureBackend, CaptureConfig, CaptureResult, CapturePipeline, CapturedFrame, Codec,
    DisplayInfo, DisplayRegistry, Frame, FrameStream, MonitorArea, PipelineConfig, PixelFormat,
    Rect, ScreenRegionPayload, StaticDisplays,
};
use tokio_util::sync::CancellationToken;

// ── Helpers ──────────────────────────────────────────────────────

fn display(name: &str, width: u32, height: u32, is_primary: bool) -> DisplayInfo {
    DisplayInfo {
        device_name: name.to_string(),
        display_name: name.to_string(),
        monitor_area: MonitorArea::new(0, 0, width, height),
        is_primary,
        scale_factor: 1.0,
    }
}

fn registry(displays: Vec<DisplayInfo>) -> Arc<DisplayRegistry> {
    Arc::new(DisplayRegistry::new(Arc::new(StaticDisplays::new(displays))))
}

/// Plays back a script, then reports no changes. Counts every call.
#[derive(Clone, Default)]
struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<CaptureResult>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    fn push(&self, result: CaptureResult) {
        self.script.lock().unwrap().push_back(result);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for ScriptedBackend {
    async fn capture(&mut self, _display: &DisplayInfo, _cursor: bool) -> CaptureResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
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

/// Every capture returns a frame that differs from the last one.
#[derive(Clone, Default)]
struct ChangingBackend {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CaptureBackend for ChangingBackend {
    async fn capture(&mut self, display: &DisplayInfo, _cursor: bool) -> CaptureResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let area = display.monitor_area;
        CaptureResult::Captured(CapturedFrame::cpu(Frame::filled(
            area.width,
            area.height,
            PixelFormat::Bgra8,
            (n % 250) as u8 + 1,
        )))
    }

    fn name(&self) -> &'static str {
        "changing"
    }
}

fn cpu(frame: Frame) -> CaptureResult {
    CaptureResult::Captured(CapturedFrame::cpu(frame))
}

async fn next_payload(rx: &mut FrameStream) -> ScreenRegionPayload {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a payload")
        .expect("stream closed")
}

// ── Scenario ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn keyframe_then_padded_delta_then_nothing() {
    let base = Frame::filled(1920, 1080, PixelFormat::Bgra8, 0x40);
    let mut changed = base.clone();
    for y in 10..60 {
        for x in 10..110 {
            changed.pixel_mut(x, y).copy_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
        }
    }

    let backend = ScriptedBackend::default();
    backend.push(cpu(base));
    backend.push(cpu(changed.clone()));
    backend.push(cpu(changed));

    let (pipeline, mut rx) = CapturePipeline::new(
        PipelineConfig::default(),
        backend.clone(),
        registry(vec![display("DISPLAY1", 1920, 1080, true)]),
    )
    .unwrap();
    let handle = pipeline.handle();
    let cancel = CancellationToken::new();
    let task = pipeline.start(cancel.clone());

    let key = next_payload(&mut rx).await;
    assert!(key.is_keyframe);
    assert_eq!(key.region(), Rect::new(0, 0, 1920, 1080));
    assert_eq!(&key.data[..2], &[0xFF, 0xD8]);

    let delta = next_payload(&mut rx).await;
    assert!(!delta.is_keyframe);
    assert_eq!(delta.region(), Rect::from_edges(8, 8, 112, 62));
    assert_eq!(handle.metrics().quality, 75);

    // The third, identical capture produces nothing.
    let idle = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(idle.is_err(), "unexpected payload");
    assert!(backend.calls() > 3);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn delta_payload_decodes_to_the_changed_pixels() {
    let base = Frame::filled(64, 32, PixelFormat::Bgra8, 0x10);
    let mut changed = base.clone();
    changed.pixel_mut(20, 10).copy_from_slice(&[1, 2, 3, 255]);

    let backend = ScriptedBackend::default();
    backend.push(cpu(base));
    backend.push(cpu(changed.clone()));

    let config = PipelineConfig {
        codec: Codec::Zstd,
        ..Default::default()
    };
    let (pipeline, mut rx) =
        CapturePipeline::new(config, backend, registry(vec![display("D", 64, 32, true)])).unwrap();
    let cancel = CancellationToken::new();
    let task = pipeline.start(cancel.clone());

    next_payload(&mut rx).await;
    let delta = next_payload(&mut rx).await;
    assert_eq!(delta.region(), Rect::from_edges(18, 8, 23, 13));
    let rgb = deskcast_core::encoder::decode_region(Codec::Zstd, &delta.data, delta.width, delta.height)
        .unwrap();
    assert_eq!(rgb, changed.crop_to_rgb(&delta.region()).unwrap());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

// ── Keyframe triggers ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn display_change_yields_exactly_one_keyframe() {
    let displays = Arc::new(StaticDisplays::new(vec![
        display("A", 64, 32, true),
        display("B", 64, 32, false),
    ]));
    let registry = Arc::new(DisplayRegistry::new(displays));
    let backend = ChangingBackend::default();
    let (pipeline, mut rx) =
        CapturePipeline::new(PipelineConfig::default(), backend, Arc::clone(&registry)).unwrap();
    let handle = pipeline.handle();
    let cancel = CancellationToken::new();
    let task = pipeline.start(cancel.clone());

    assert!(next_payload(&mut rx).await.is_keyframe);
    for _ in 0..3 {
        assert!(!next_payload(&mut rx).await.is_keyframe);
    }

    handle.select_display("B").unwrap();
    // One payload may already have been captured for A before the switch.
    let mut kinds = Vec::new();
    for _ in 0..6 {
        kinds.push(next_payload(&mut rx).await.is_keyframe);
    }
    assert_eq!(kinds.iter().filter(|k| **k).count(), 1, "{kinds:?}");
    assert_eq!(handle.metrics().extra.get("display").map(String::as_str), Some("B"));

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn explicit_request_yields_keyframe() {
    let backend = ChangingBackend::default();
    let (pipeline, mut rx) = CapturePipeline::new(
        PipelineConfig::default(),
        backend,
        registry(vec![display("A", 32, 32, true)]),
    )
    .unwrap();
    let handle = pipeline.handle();
    let cancel = CancellationToken::new();
    let task = pipeline.start(cancel.clone());

    assert!(next_payload(&mut rx).await.is_keyframe);
    assert!(!next_payload(&mut rx).await.is_keyframe);

    handle.request_keyframe();
    let mut kinds = Vec::new();
    for _ in 0..4 {
        kinds.push(next_payload(&mut rx).await.is_keyframe);
    }
    assert_eq!(kinds.iter().filter(|k| **k).count(), 1, "{kinds:?}");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

// ── Backpressure ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stalled_consumer_suspends_capture() {
    let backend = ChangingBackend::default();
    let calls = Arc::clone(&backend.calls);
    let (pipeline, mut rx) = CapturePipeline::new(
        PipelineConfig::default(),
        backend,
        registry(vec![display("A", 16, 16, true)]),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let task = pipeline.start(cancel.clone());

    tokio::time::sleep(Duration::from_secs(2)).await;
    // One frame fills the slot; the next pass waits for it to drain.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(next_payload(&mut rx).await.is_keyframe);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn closed_gate_suspends_capture() {
    let backend = ChangingBackend::default();
    let calls = Arc::clone(&backend.calls);
    let (pipeline, mut rx) = CapturePipeline::new(
        PipelineConfig::default(),
        backend,
        registry(vec![display("A", 16, 16, true)]),
    )
    .unwrap();
    let handle = pipeline.handle();
    let cancel = CancellationToken::new();
    let task = pipeline.start(cancel.clone());

    assert!(next_payload(&mut rx).await.is_keyframe);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The next delta waits in the slot.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Far above the ceiling; the next metrics tick closes the gate.
    handle.controller().mark_bytes_sent(50_000_000);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.controller().is_gate_open());

    assert!(!next_payload(&mut rx).await.is_keyframe);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The burst ages out of the window and capture resumes.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(handle.controller().is_gate_open());
    assert!(calls.load(Ordering::SeqCst) > 2);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_stops_the_pipeline() {
    let (pipeline, rx) = CapturePipeline::new(
        PipelineConfig::default(),
        ChangingBackend::default(),
        registry(vec![display("A", 16, 16, true)]),
    )
    .unwrap();
    let task = pipeline.start(CancellationToken::new());
    drop(rx);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("pipeline did not stop")
        .unwrap()
        .unwrap();
}

// ── GPU fault recovery ───────────────────────────────────────────

struct FaultingHandle {
    acquisitions: Arc<AtomicUsize>,
}

impl OutputHandle for FaultingHandle {
    fn acquire_frame(&mut self, _timeout: Duration) -> Result<AcquiredFrame, AcquireError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Err(AcquireError::Fault("device removed".into()))
    }
}

struct FaultingFactory {
    acquisitions: Arc<AtomicUsize>,
}

impl OutputFactory for FaultingFactory {
    type Handle = FaultingHandle;

    fn create(&mut self, _device_name: &str) -> deskcast_core::Result<NativeOutput<FaultingHandle>> {
        Ok(NativeOutput {
            handle: FaultingHandle {
                acquisitions: Arc::clone(&self.acquisitions),
            },
            bounds: Rect::new(0, 0, 32, 32),
            rotation: Default::default(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn faulted_gpu_is_left_alone_for_the_ttl() {
    let acquisitions = Arc::new(AtomicUsize::new(0));
    let fallback = ChangingBackend::default();
    let fallback_calls = Arc::clone(&fallback.calls);
    let capture = CaptureConfig::default();
    let backend = GpuCaptureBackend::new(
        FaultingFactory {
            acquisitions: Arc::clone(&acquisitions),
        },
        Box::new(fallback),
        &capture,
    );

    let (pipeline, mut rx) = CapturePipeline::new(
        PipelineConfig::default(),
        backend,
        registry(vec![display("A", 32, 32, true)]),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let task = pipeline.start(cancel.clone());

    // Fault on the first pass, then the CPU fallback keeps frames flowing.
    assert!(next_payload(&mut rx).await.is_keyframe);
    for _ in 0..20 {
        next_payload(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(acquisitions.load(Ordering::SeqCst), 1);
    assert!(fallback_calls.load(Ordering::SeqCst) >= 21);

    // Past the TTL the output is recreated and faults again.
    tokio::time::sleep(capture.fault_ttl()).await;
    next_payload(&mut rx).await;
    next_payload(&mut rx).await;
    assert_eq!(acquisitions.load(Ordering::SeqCst), 2);

    cancel.cancel();
    task.await.unwrap().unwrap();
}
