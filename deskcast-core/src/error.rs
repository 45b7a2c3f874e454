//! Domain-specific error types for the capture engine.
//!
//! All fallible operations return `Result<T, DeskcastError>`.
//! Capture-time conditions that are part of normal operation (no new
//! frame, GPU timeout) are *not* errors; they are variants of
//! [`crate::capture::CaptureResult`].

use thiserror::Error;

/// The canonical error type for the capture engine.
#[derive(Debug, Error)]
pub enum DeskcastError {
    // ── Capture Errors ───────────────────────────────────────────
    /// A capture backend reported a failure.
    #[error("capture failed: {0}")]
    Capture(String),

    /// The requested capture backend does not exist on this platform.
    #[error("capture backend unavailable: {0}")]
    BackendUnavailable(&'static str),

    // ── Display Errors ───────────────────────────────────────────
    /// No display with the given device name is attached.
    #[error("display not found: {0}")]
    DisplayNotFound(String),

    /// Display enumeration returned nothing.
    #[error("no displays attached")]
    NoDisplays,

    // ── Diff Errors ──────────────────────────────────────────────
    /// The two frames being compared have different dimensions.
    #[error("frame dimensions differ: {current:?} vs {previous:?}")]
    DimensionMismatch {
        current: (u32, u32),
        previous: (u32, u32),
    },

    /// The two frames being compared have different pixel layouts.
    #[error("frame pixel formats differ")]
    PixelFormatMismatch,

    // ── Encode Errors ────────────────────────────────────────────
    /// Cropping or compressing a region failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A region does not intersect the frame it was cropped from.
    #[error("region {0:?} is outside the frame")]
    RegionOutOfBounds(crate::types::Rect),

    // ── Transport Errors ─────────────────────────────────────────
    /// Received bytes that do not start with the expected magic.
    #[error("invalid magic bytes: expected DKC1")]
    InvalidMagic,

    /// The payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    // ── Channel Errors ───────────────────────────────────────────
    /// The frame channel or another mpsc channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value is outside its allowed range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeskcastError>;

// ── Convenient From implementations ──────────────────────────────

impl From<String> for DeskcastError {
    fn from(s: String) -> Self {
        DeskcastError::Other(s)
    }
}

impl From<&str> for DeskcastError {
    fn from(s: &str) -> Self {
        DeskcastError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DeskcastError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DeskcastError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for DeskcastError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        DeskcastError::Encoding(e.to_string())
    }
}

impl From<image::ImageError> for DeskcastError {
    fn from(e: image::ImageError) -> Self {
        DeskcastError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = DeskcastError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = DeskcastError::DimensionMismatch {
            current: (1920, 1080),
            previous: (1280, 720),
        };
        assert!(e.to_string().contains("1920"));
        assert!(e.to_string().contains("720"));
    }

    #[test]
    fn from_string() {
        let e: DeskcastError = "something broke".into();
        assert!(matches!(e, DeskcastError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: DeskcastError = io_err.into();
        assert!(matches!(e, DeskcastError::Connection(_)));
    }

    #[tokio::test]
    async fn from_send_error() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(1);
        drop(rx);
        let e: DeskcastError = tx.send(1).await.unwrap_err().into();
        assert!(matches!(e, DeskcastError::ChannelClosed));
    }
}
