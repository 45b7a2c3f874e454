//! Native GPU output lifecycle.
//!
//! A GPU duplication handle is expensive to create and can fault at any
//! time (mode change, secure desktop, lid closed, driver reset). The
//! [`OutputResourceManager`] owns at most one live handle, recreates it
//! when the target display changes, and puts faulted displays into a
//! [`FaultCache`] so they are not retried in a tight loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{Frame, Rect, Rotation};

// ── Native seam ──────────────────────────────────────────────────

/// Why a frame acquisition did not produce a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireError {
    /// Nothing arrived within the wait.
    Timeout,
    /// The handle is unusable and must be recreated.
    Fault(String),
}

/// One acquisition from a native output.
#[derive(Debug)]
pub struct AcquiredFrame {
    /// Compositor frames accumulated since the last acquisition.
    /// Zero means only pointer metadata changed.
    pub accumulated_frames: u32,
    /// Unrotated pixels; `None` when `accumulated_frames` is zero.
    pub frame: Option<Frame>,
    /// Unrotated dirty rects reported by the compositor.
    pub dirty_rects: Vec<Rect>,
}

/// A live duplication handle.
pub trait OutputHandle: Send {
    /// Wait up to `timeout` for the next desktop frame.
    fn acquire_frame(&mut self, timeout: Duration) -> std::result::Result<AcquiredFrame, AcquireError>;
}

/// A freshly created handle plus the output's geometry.
pub struct NativeOutput<H> {
    pub handle: H,
    /// Output size in the unrotated orientation.
    pub bounds: Rect,
    pub rotation: Rotation,
}

/// Creates duplication handles by display device name.
pub trait OutputFactory: Send {
    type Handle: OutputHandle;

    fn create(&mut self, device_name: &str) -> Result<NativeOutput<Self::Handle>>;
}

// ── OutputResource ───────────────────────────────────────────────

/// The live handle for one display plus capture bookkeeping.
pub struct OutputResource<H> {
    pub device_name: String,
    pub bounds: Rect,
    pub handle: H,
    pub rotation: Rotation,
    pub last_successful_capture: Option<Instant>,
    /// Where the cursor was drawn in the last frame.
    pub last_cursor_area: Option<Rect>,
}

impl<H> OutputResource<H> {
    fn new(device_name: &str, native: NativeOutput<H>) -> Self {
        Self {
            device_name: device_name.to_string(),
            bounds: native.bounds,
            handle: native.handle,
            rotation: native.rotation,
            last_successful_capture: None,
            last_cursor_area: None,
        }
    }

    /// `true` if the last successful capture is younger than `window`.
    pub fn is_healthy(&self, window: Duration) -> bool {
        self.last_successful_capture
            .is_some_and(|at| at.elapsed() < window)
    }
}

// ── FaultCache ───────────────────────────────────────────────────

/// Device names that faulted recently, each with an expiry.
#[derive(Debug, Default)]
pub struct FaultCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl FaultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `device_name` for `ttl` from now.
    pub fn insert(&self, device_name: &str, ttl: Duration) {
        self.insert_at(device_name, Instant::now() + ttl);
    }

    pub fn insert_at(&self, device_name: &str, expires: Instant) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_name.to_string(), expires);
    }

    /// `true` while `device_name` is blocked. Expired entries are dropped.
    pub fn contains(&self, device_name: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, expires| *expires > now);
        entries.contains_key(device_name)
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── OutputResourceManager ────────────────────────────────────────

/// Owns the single live GPU output.
pub struct OutputResourceManager<F: OutputFactory> {
    factory: F,
    current: Option<OutputResource<F::Handle>>,
    faults: Arc<FaultCache>,
    fault_ttl: Duration,
}

impl<F: OutputFactory> OutputResourceManager<F> {
    pub fn new(factory: F, fault_ttl: Duration) -> Self {
        Self {
            factory,
            current: None,
            faults: Arc::new(FaultCache::new()),
            fault_ttl,
        }
    }

    /// The resource for `device_name`, creating it if needed.
    ///
    /// Returns `None` while the display is fault-cached or when creation
    /// fails (which fault-caches it).
    pub fn get(&mut self, device_name: &str) -> Option<&mut OutputResource<F::Handle>> {
        if self.faults.contains(device_name) {
            return None;
        }

        if self
            .current
            .as_ref()
            .is_some_and(|r| r.device_name != device_name)
        {
            debug!(device_name, "target display changed; releasing gpu output");
            self.current = None;
        }

        if self.current.is_none() {
            match self.factory.create(device_name) {
                Ok(native) => {
                    info!(device_name, "created gpu output");
                    self.current = Some(OutputResource::new(device_name, native));
                }
                Err(e) => {
                    warn!(device_name, "failed to create gpu output: {e}");
                    self.faults.insert(device_name, self.fault_ttl);
                    return None;
                }
            }
        }

        self.current.as_mut()
    }

    /// Drop the current resource and block its display for the fault TTL.
    pub fn recycle(&mut self) {
        if let Some(resource) = self.current.take() {
            warn!(
                device_name = %resource.device_name,
                ttl = ?self.fault_ttl,
                "recycling faulted gpu output"
            );
            self.faults.insert(&resource.device_name, self.fault_ttl);
        }
    }

    /// Shared handle to the fault cache.
    pub fn fault_cache(&self) -> Arc<FaultCache> {
        Arc::clone(&self.faults)
    }

    /// Release the native handle now.
    pub fn shutdown(&mut self) {
        if let Some(resource) = self.current.take() {
            debug!(device_name = %resource.device_name, "releasing gpu output");
        }
    }

    pub fn current_device(&self) -> Option<&str> {
        self.current.as_ref().map(|r| r.device_name.as_str())
    }
}

impl<F: OutputFactory> Drop for OutputResourceManager<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ────────────────────────────────────────────────────────
