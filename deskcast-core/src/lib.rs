//! # deskcast-core
//!
//! Adaptive desktop capture and streaming engine.
//!
//! This crate contains:
//! - **Displays**: `DisplayRegistry` for enumeration and selection
//! - **Capture**: `CaptureBackend` with a GPU duplication path, CPU fallback
//!   and a synthetic test pattern
//! - **Diff**: `DirtyRegionEngine` for changed-region detection
//! - **Encoder**: `FrameEncoder` (JPEG / zstd) for region payloads
//! - **Bandwidth**: `BandwidthController` for telemetry, quality and the
//!   bandwidth gate
//! - **Pipeline**: `CapturePipeline`, the capture → diff → encode → send loop
//! - **Transport**: `DeskcastCodec` and `ViewerConnection` for TCP delivery
//! - **Error**: `DeskcastError`, a typed `thiserror` hierarchy

pub mod bandwidth;
pub mod capture;
pub mod channel;
pub mod config;
pub mod diff;
pub mod display;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod platform;
pub mod transport;
pub mod types;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bandwidth::{BandwidthController, MetricsSnapshot};
pub use capture::{
    BackendKind, CaptureBackend, CaptureFailure, CaptureResult, CapturedFrame, create_backend,
    create_display_source,
};
pub use channel::{FrameSender, FrameSlot, FrameStream, ScreenRegionPayload, frame_channel};
pub use config::{BandwidthConfig, CaptureConfig, PipelineConfig};
pub use diff::DirtyRegionEngine;
pub use display::{DisplayInfo, DisplayRegistry, DisplaySource, StaticDisplays};
pub use encoder::{Codec, FrameEncoder};
pub use error::{DeskcastError, Result};
pub use pipeline::{CapturePipeline, KeyframeReason, PipelineHandle};
pub use transport::{DeskcastCodec, Message, ViewerConnection};
pub use types::{Frame, MonitorArea, PixelFormat, Rect, Rotation};
