//! Adaptive bandwidth controller.
//!
//! Records three sample series over a trailing window and turns them
//! into capture telemetry and an encode quality:
//!
//! - **bytes sent**: one sample per encoded payload.
//! - **frames sent**: one sample per payload handed to the channel.
//! - **iterations**: one sample per capture attempt, productive or not.
//!
//! A periodic [`process_metrics`](BandwidthController::process_metrics)
//! pass prunes expired samples, derives Fps / Ips / Mbps, steers the
//! quality towards the configured target throughput, and opens or closes
//! the bandwidth gate the capture loop waits on.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::BandwidthConfig;
use crate::error::{DeskcastError, Result};

/// Capacity of the snapshot broadcast channel.
const SNAPSHOT_CAPACITY: usize = 16;

// ── MetricsSnapshot ──────────────────────────────────────────────

/// Point-in-time view of the capture telemetry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Payloads sent per second.
    pub fps: f64,
    /// Capture attempts per second.
    pub ips: f64,
    /// Outbound throughput in megabits per second.
    pub mbps: f64,
    /// Current delta encode quality.
    pub quality: u8,
    pub is_using_gpu: bool,
    /// `true` while quality sits below the configured default.
    pub is_quality_reduced: bool,
    /// Free-form diagnostics (selected display, backend, bounds).
    pub extra: BTreeMap<String, String>,
}

// ── Samples ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Samples {
    bytes: VecDeque<(Instant, usize)>,
    frames: VecDeque<Instant>,
    iterations: VecDeque<Instant>,
}

impl Samples {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(ts, _)) = self.bytes.front() {
            if now.saturating_duration_since(ts) > window {
                self.bytes.pop_front();
            } else {
                break;
            }
        }
        prune_instants(&mut self.frames, now, window);
        prune_instants(&mut self.iterations, now, window);
    }
}

fn prune_instants(series: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&ts) = series.front() {
        if now.saturating_duration_since(ts) > window {
            series.pop_front();
        } else {
            break;
        }
    }
}

/// Events per second over `window`. A lone sample counts as one per
/// second so a single frame does not read as a fraction.
fn rate(count: usize, window: Duration) -> f64 {
    match count {
        0 => 0.0,
        1 => 1.0,
        n => n as f64 / window.as_secs_f64(),
    }
}

/// bytes → MiB → megabits per second over `window`.
fn bytes_to_mbps(bytes: usize, window: Duration) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / window.as_secs_f64() * 8.0
}

/// One quality-control step.
///
/// Over target, the new quality scales the current one by
/// `target / mbps`. Under target, it scales the default quality, so an
/// idle link recovers fully. Decreases apply at once (floored at the
/// minimum); increases move at most `quality_step` per call and never
/// exceed the default.
pub fn next_quality(current: u8, mbps: f64, config: &BandwidthConfig) -> u8 {
    let minimum = config.minimum_quality;
    let default = config.default_quality.max(minimum);
    let current = current.clamp(minimum, default);

    let target = if mbps.is_nan() || mbps <= 0.0 {
        default as f64
    } else if mbps > config.target_mbps {
        config.target_mbps / mbps * current as f64
    } else {
        config.target_mbps / mbps * default as f64
    };
    let target = target.clamp(0.0, u8::MAX as f64) as u8;

    if target < current {
        target.max(minimum)
    } else {
        let ceiling = target.min(default);
        current.saturating_add(config.quality_step).min(ceiling)
    }
}

// ── BandwidthController ──────────────────────────────────────────

#[derive(Debug)]
struct Derived {
    fps: f64,
    ips: f64,
    mbps: f64,
    quality: u8,
    /// Number of times quality has been lowered.
    reductions: u64,
}

/// Shared telemetry and quality state for one capture pipeline.
///
/// All methods take `&self`; share it behind an [`Arc`].
pub struct BandwidthController {
    config: BandwidthConfig,
    samples: Mutex<Samples>,
    /// Held for the whole of a processing pass.
    processing: Mutex<()>,
    derived: Mutex<Derived>,
    using_gpu: AtomicBool,
    extra: Mutex<BTreeMap<String, String>>,
    gate: watch::Sender<bool>,
    snapshots: broadcast::Sender<MetricsSnapshot>,
}

impl BandwidthController {
    pub fn new(config: BandwidthConfig) -> Self {
        let (gate, _) = watch::channel(true);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        Self {
            derived: Mutex::new(Derived {
                fps: 0.0,
                ips: 0.0,
                mbps: 0.0,
                quality: config.default_quality,
                reductions: 0,
            }),
            config,
            samples: Mutex::new(Samples::default()),
            processing: Mutex::new(()),
            using_gpu: AtomicBool::new(false),
            extra: Mutex::new(BTreeMap::new()),
            gate,
            snapshots,
        }
    }

    pub fn config(&self) -> &BandwidthConfig {
        &self.config
    }

    // ── Sample recording ─────────────────────────────────────────

    pub fn mark_bytes_sent(&self, len: usize) {
        self.mark_bytes_sent_at(Instant::now(), len);
    }

    pub fn mark_bytes_sent_at(&self, when: Instant, len: usize) {
        lock(&self.samples).bytes.push_back((when, len));
    }

    pub fn mark_frame_sent(&self) {
        self.mark_frame_sent_at(Instant::now());
    }

    pub fn mark_frame_sent_at(&self, when: Instant) {
        lock(&self.samples).frames.push_back(when);
    }

    pub fn mark_iteration(&self) {
        self.mark_iteration_at(Instant::now());
    }

    pub fn mark_iteration_at(&self, when: Instant) {
        lock(&self.samples).iterations.push_back(when);
    }

    // ── Processing ───────────────────────────────────────────────

    /// Run one metrics pass. Returns `false` if another pass was in
    /// progress and this one was skipped.
    pub fn process_metrics(&self) -> bool {
        self.process_metrics_at(Instant::now())
    }

    pub fn process_metrics_at(&self, now: Instant) -> bool {
        let Ok(_pass) = self.processing.try_lock() else {
            trace!("metrics pass already running, skipping tick");
            return false;
        };

        let window = self.config.window();
        let (fps, ips, mbps) = {
            let mut samples = lock(&self.samples);
            samples.prune(now, window);
            let bytes: usize = samples.bytes.iter().map(|&(_, len)| len).sum();
            let mbps = if samples.bytes.is_empty() {
                0.0
            } else {
                bytes_to_mbps(bytes, window)
            };
            (
                rate(samples.frames.len(), window),
                rate(samples.iterations.len(), window),
                mbps,
            )
        };

        {
            let mut derived = lock(&self.derived);
            let quality = next_quality(derived.quality, mbps, &self.config);
            if quality != derived.quality {
                debug!(from = derived.quality, to = quality, mbps, "quality adjusted");
            }
            if quality < derived.quality {
                derived.reductions += 1;
            }
            *derived = Derived {
                fps,
                ips,
                mbps,
                quality,
                reductions: derived.reductions,
            };
        }

        let open = mbps < self.config.max_mbps;
        self.gate.send_if_modified(|state| {
            if *state == open {
                return false;
            }
            if open {
                debug!(mbps, "bandwidth gate reopened");
            } else {
                debug!(mbps, max = self.config.max_mbps, "bandwidth ceiling reached, pausing capture");
            }
            *state = open;
            true
        });
        true
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Quality for the next delta encode.
    pub fn quality(&self) -> u8 {
        lock(&self.derived).quality
    }

    pub fn mbps(&self) -> f64 {
        lock(&self.derived).mbps
    }

    pub fn fps(&self) -> f64 {
        lock(&self.derived).fps
    }

    pub fn ips(&self) -> f64 {
        lock(&self.derived).ips
    }

    /// Count of quality reductions so far. Changes whenever a metrics
    /// pass lowers quality.
    pub fn quality_reductions(&self) -> u64 {
        lock(&self.derived).reductions
    }

    pub fn is_quality_reduced(&self) -> bool {
        self.quality() < self.config.default_quality
    }

    pub fn is_gate_open(&self) -> bool {
        *self.gate.borrow()
    }

    /// Resolve once throughput is below the ceiling. Returns immediately
    /// while the gate is open.
    pub async fn wait_for_bandwidth(&self) -> Result<()> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| DeskcastError::ChannelClosed)
    }

    pub fn set_using_gpu(&self, using_gpu: bool) {
        self.using_gpu.store(using_gpu, Ordering::Relaxed);
    }

    pub fn set_diagnostic(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.extra).insert(key.into(), value.into());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (fps, ips, mbps, quality) = {
            let d = lock(&self.derived);
            (d.fps, d.ips, d.mbps, d.quality)
        };
        MetricsSnapshot {
            fps,
            ips,
            mbps,
            quality,
            is_using_gpu: self.using_gpu.load(Ordering::Relaxed),
            is_quality_reduced: quality < self.config.default_quality,
            extra: lock(&self.extra).clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    /// Publish the current snapshot to every subscriber.
    pub fn broadcast_metrics(&self) -> MetricsSnapshot {
        let snapshot = self.snapshot();
        debug!(
            fps = format_args!("{:.1}", snapshot.fps),
            ips = format_args!("{:.1}", snapshot.ips),
            mbps = format_args!("{:.2}", snapshot.mbps),
            quality = snapshot.quality,
            gpu = snapshot.is_using_gpu,
            "capture metrics"
        );
        // No receivers is fine.
        let _ = self.snapshots.send(snapshot.clone());
        snapshot
    }

    /// Spawn the processing and broadcast timers. Both stop when `cancel`
    /// fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let tick_period = this.config.tick();
            let broadcast_period = this.config.broadcast_interval();
            let mut tick = tokio::time::interval_at(Instant::now() + tick_period, tick_period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut broadcast =
                tokio::time::interval_at(Instant::now() + broadcast_period, broadcast_period);
            broadcast.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        this.process_metrics();
                    }
                    _ = broadcast.tick() => {
                        this.broadcast_metrics();
                    }
                }
            }
            debug!("bandwidth controller stopped");
        })
    }
}

impl Default for BandwidthController {
    fn default() -> Self {
        Self::new(BandwidthConfig::default())
    }
}

impl std::fmt::Debug for BandwidthController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthController")
            .field("config", &self.config)
            .field("quality", &self.quality())
            .field("gate_open", &self.is_gate_open())
            .finish()
    }
}

/// Samples and derived values stay consistent even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────
