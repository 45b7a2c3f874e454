//! Configuration for the agent.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use deskcast_core::capture::BackendKind;
use deskcast_core::{BandwidthConfig, CaptureConfig, Codec, PipelineConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Screen capture settings.
    pub capture: CaptureSection,
    /// Adaptive quality loop.
    pub bandwidth: BandwidthConfig,
    /// Capture loop timing and keyframes.
    pub pipeline: PipelineSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address viewers connect to.
    pub listen_addr: String,
}

/// Screen capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// "auto", "dxgi", "gdi" or "synthetic".
    pub backend: BackendKind,
    /// Device name to capture at startup. Primary when unset.
    pub display: Option<String>,
    pub capture_cursor: bool,
    /// "jpeg" or "zstd".
    pub codec: Codec,
    pub gpu_timeout_ms: u64,
    pub gpu_health_window_ms: u64,
    pub fault_ttl_secs: u64,
    pub allow_cpu_fallback: bool,
    /// How often the display list is re-read to detect monitor changes.
    pub display_poll_ms: u64,
}

/// Capture loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub no_change_delay_ms: u64,
    pub failure_delay_ms: u64,
    pub keyframe_quality: u8,
    pub diff_padding: u32,
    pub quality_refresh_ratio: f64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive; `RUST_LOG` overrides it.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7331".into(),
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            backend: BackendKind::Auto,
            display: None,
            capture_cursor: capture.capture_cursor,
            codec: Codec::default(),
            gpu_timeout_ms: capture.gpu_timeout_ms,
            gpu_health_window_ms: capture.gpu_health_window_ms,
            fault_ttl_secs: capture.fault_ttl_secs,
            allow_cpu_fallback: capture.allow_cpu_fallback,
            display_poll_ms: 2000,
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            no_change_delay_ms: pipeline.no_change_delay_ms,
            failure_delay_ms: pipeline.failure_delay_ms,
            keyframe_quality: pipeline.keyframe_quality,
            diff_padding: pipeline.diff_padding,
            quality_refresh_ratio: pipeline.quality_refresh_ratio,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|e| e.to_string())?;
        config
            .to_pipeline_config()
            .validate()
            .map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default_toml().map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Assemble the engine configuration.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            no_change_delay_ms: self.pipeline.no_change_delay_ms,
            failure_delay_ms: self.pipeline.failure_delay_ms,
            keyframe_quality: self.pipeline.keyframe_quality,
            diff_padding: self.pipeline.diff_padding,
            quality_refresh_ratio: self.pipeline.quality_refresh_ratio,
            codec: self.capture.codec,
            capture: CaptureConfig {
                capture_cursor: self.capture.capture_cursor,
                gpu_timeout_ms: self.capture.gpu_timeout_ms,
                gpu_health_window_ms: self.capture.gpu_health_window_ms,
                fault_ttl_secs: self.capture.fault_ttl_secs,
                allow_cpu_fallback: self.capture.allow_cpu_fallback,
            },
            bandwidth: self.bandwidth.clone(),
        }
    }

    pub fn display_poll_interval(&self) -> Duration {
        Duration::from_millis(self.capture.display_poll_ms.max(100))
    }
}

// ── Tests ────────────────────────────────────────────────────────
