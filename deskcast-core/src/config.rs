//! Tunables for the capture pipeline.
//!
//! Every struct deserialises with `#[serde(default)]`, so a partial TOML
//! section only overrides what it names. Durations are stored as plain
//! integers so they round-trip through config files unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encoder::Codec;
use crate::error::{DeskcastError, Result};

// ── CaptureConfig ────────────────────────────────────────────────

/// GPU capture and fault-recovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Draw the mouse cursor into captured frames.
    pub capture_cursor: bool,
    /// How long a single GPU frame acquisition may wait.
    pub gpu_timeout_ms: u64,
    /// A GPU output that captured successfully within this window is
    /// considered healthy; an idle timeout then means "no changes".
    pub gpu_health_window_ms: u64,
    /// How long a faulted output is left alone before re-creation.
    pub fault_ttl_secs: u64,
    /// Fall back to the CPU backend when the GPU path fails.
    pub allow_cpu_fallback: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_cursor: true,
            gpu_timeout_ms: 50,
            gpu_health_window_ms: 1500,
            fault_ttl_secs: 10,
            allow_cpu_fallback: true,
        }
    }
}

impl CaptureConfig {
    pub fn gpu_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu_timeout_ms)
    }

    pub fn gpu_health_window(&self) -> Duration {
        Duration::from_millis(self.gpu_health_window_ms)
    }

    pub fn fault_ttl(&self) -> Duration {
        Duration::from_secs(self.fault_ttl_secs)
    }
}

// ── BandwidthConfig ──────────────────────────────────────────────

/// Quality-control loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Trailing window over which rates are computed.
    pub window_ms: u64,
    /// Metrics processing interval.
    pub tick_ms: u64,
    /// Snapshot broadcast interval.
    pub broadcast_interval_ms: u64,
    /// Throughput the quality loop steers towards.
    pub target_mbps: f64,
    /// Throughput at which capture is paused.
    pub max_mbps: f64,
    /// Upper quality bound, also the starting quality.
    pub default_quality: u8,
    /// Lower quality bound.
    pub minimum_quality: u8,
    /// Largest upward quality change per tick.
    pub quality_step: u8,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            window_ms: 3000,
            tick_ms: 100,
            broadcast_interval_ms: 3000,
            target_mbps: 3.0,
            max_mbps: 8.0,
            default_quality: 75,
            minimum_quality: 20,
            quality_step: 2,
        }
    }
}

impl BandwidthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    /// Reject settings the controller cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 || self.tick_ms == 0 || self.broadcast_interval_ms == 0 {
            return Err(DeskcastError::InvalidConfig(
                "bandwidth intervals must be non-zero".into(),
            ));
        }
        if !(1..=100).contains(&self.minimum_quality)
            || !(1..=100).contains(&self.default_quality)
            || self.minimum_quality > self.default_quality
        {
            return Err(DeskcastError::InvalidConfig(format!(
                "quality bounds must satisfy 1 <= minimum ({}) <= default ({}) <= 100",
                self.minimum_quality, self.default_quality
            )));
        }
        if self.target_mbps <= 0.0 || self.max_mbps <= 0.0 {
            return Err(DeskcastError::InvalidConfig(
                "target_mbps and max_mbps must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── PipelineConfig ───────────────────────────────────────────────

/// Capture loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Delay after a capture that produced nothing new.
    pub no_change_delay_ms: u64,
    /// Back-off after a failed capture or missing display.
    pub failure_delay_ms: u64,
    /// Quality used for every keyframe.
    pub keyframe_quality: u8,
    /// Padding around detected changes.
    pub diff_padding: u32,
    /// After quality was reduced, send a full-quality keyframe once
    /// throughput falls below `target_mbps * quality_refresh_ratio`.
    pub quality_refresh_ratio: f64,
    /// Compression used for region payloads.
    pub codec: Codec,
    pub capture: CaptureConfig,
    pub bandwidth: BandwidthConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            no_change_delay_ms: 10,
            failure_delay_ms: 100,
            keyframe_quality: 75,
            diff_padding: crate::diff::DEFAULT_PADDING,
            quality_refresh_ratio: 0.5,
            codec: Codec::default(),
            capture: CaptureConfig::default(),
            bandwidth: BandwidthConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn no_change_delay(&self) -> Duration {
        Duration::from_millis(self.no_change_delay_ms)
    }

    pub fn failure_delay(&self) -> Duration {
        Duration::from_millis(self.failure_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.keyframe_quality) {
            return Err(DeskcastError::InvalidConfig(format!(
                "keyframe_quality {} outside 1..=100",
                self.keyframe_quality
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_refresh_ratio) {
            return Err(DeskcastError::InvalidConfig(format!(
                "quality_refresh_ratio {} outside 0.0..=1.0",
                self.quality_refresh_ratio
            )));
        }
        self.bandwidth.validate()
    }
}
