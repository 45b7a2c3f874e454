//! Display enumeration and selection.
//!
//! [`DisplayRegistry`] owns the current display list and the selected
//! display. The capture loop reads the selection every iteration while
//! the OS "display settings changed" hook and the public
//! [`select`](DisplayRegistry::select) call may mutate it concurrently,
//! so all of it sits behind one lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DeskcastError, Result};
use crate::types::MonitorArea;

// ── DisplayInfo ──────────────────────────────────────────────────

/// One attached display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    /// OS device name, e.g. `\\.\DISPLAY1`. Identity key.
    pub device_name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Placement on the virtual desktop.
    pub monitor_area: MonitorArea,
    pub is_primary: bool,
    /// DPI scale (1.0 = 96 DPI).
    pub scale_factor: f64,
}

// ── DisplaySource ────────────────────────────────────────────────

/// Platform hook that lists the attached displays.
pub trait DisplaySource: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>>;
}

// ── DisplayRegistry ──────────────────────────────────────────────

#[derive(Default)]
struct RegistryState {
    displays: Vec<DisplayInfo>,
    selected: Option<DisplayInfo>,
}

/// Tracks attached displays and the one being captured.
pub struct DisplayRegistry {
    source: Arc<dyn DisplaySource>,
    state: Mutex<RegistryState>,
}

impl DisplayRegistry {
    /// Create a registry and perform the first enumeration.
    pub fn new(source: Arc<dyn DisplaySource>) -> Self {
        let registry = Self {
            source,
            state: Mutex::new(RegistryState::default()),
        };
        registry.reload();
        registry
    }

    /// Re-enumerate displays. The selection is refreshed by device name
    /// but is *not* moved to another display; see
    /// [`handle_display_settings_changed`](Self::handle_display_settings_changed).
    ///
    /// Enumeration failures keep the previous list.
    pub fn reload(&self) {
        let displays = match self.source.enumerate() {
            Ok(displays) => displays,
            Err(e) => {
                warn!("display enumeration failed: {e}");
                return;
            }
        };
        let mut state = self.state();
        if let Some(selected) = &state.selected {
            state.selected = displays
                .iter()
                .find(|d| d.device_name == selected.device_name)
                .cloned();
        }
        state.displays = displays;
    }

    /// Snapshot of the current display list.
    pub fn displays(&self) -> Vec<DisplayInfo> {
        self.state().displays.clone()
    }

    /// The primary display, or the first one if none is flagged primary.
    pub fn primary(&self) -> Option<DisplayInfo> {
        Self::primary_of(&self.state().displays)
    }

    pub fn find(&self, device_name: &str) -> Option<DisplayInfo> {
        self.state()
            .displays
            .iter()
            .find(|d| d.device_name == device_name)
            .cloned()
    }

    /// The current selection, if any.
    pub fn selected(&self) -> Option<DisplayInfo> {
        self.state().selected.clone()
    }

    /// The current selection, selecting the primary display first if
    /// nothing is selected yet.
    pub fn selected_or_primary(&self) -> Option<DisplayInfo> {
        let mut state = self.state();
        if state.selected.is_none() {
            state.selected = Self::primary_of(&state.displays);
        }
        state.selected.clone()
    }

    /// Switch capture to `device_name`.
    pub fn select(&self, device_name: &str) -> Result<DisplayInfo> {
        let mut state = self.state();
        let display = state
            .displays
            .iter()
            .find(|d| d.device_name == device_name)
            .cloned()
            .ok_or_else(|| DeskcastError::DisplayNotFound(device_name.to_string()))?;
        state.selected = Some(display.clone());
        Ok(display)
    }

    /// React to an OS display-configuration change: re-enumerate, keep
    /// the selection if its device still exists, else fall back to primary.
    pub fn handle_display_settings_changed(&self) {
        info!("display settings changed; refreshing display list");
        let displays = match self.source.enumerate() {
            Ok(displays) => displays,
            Err(e) => {
                warn!("display enumeration failed: {e}");
                return;
            }
        };
        let mut state = self.state();
        let kept = state.selected.as_ref().and_then(|selected| {
            displays
                .iter()
                .find(|d| d.device_name == selected.device_name)
                .cloned()
        });
        state.selected = kept.or_else(|| Self::primary_of(&displays));
        state.displays = displays;
    }

    /// Convert a viewer-relative position (0.0–1.0 on each axis) on
    /// `display` to absolute virtual-desktop coordinates.
    pub fn to_absolute(display: &DisplayInfo, percent_x: f64, percent_y: f64) -> (i32, i32) {
        let area = display.monitor_area;
        let x = area.left as f64 + area.width as f64 * percent_x;
        let y = area.top as f64 + area.height as f64 * percent_y;
        (x as i32, y as i32)
    }

    /// Bounding box of every attached display.
    pub fn virtual_bounds(&self) -> MonitorArea {
        self.state()
            .displays
            .iter()
            .map(|d| d.monitor_area)
            .reduce(|acc, area| acc.union(&area))
            .unwrap_or_default()
    }

    // ── Internal ─────────────────────────────────────────────────

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn primary_of(displays: &[DisplayInfo]) -> Option<DisplayInfo> {
        displays
            .iter()
            .find(|d| d.is_primary)
            .or_else(|| displays.first())
            .cloned()
    }
}

// ── StaticDisplays ───────────────────────────────────────────────

/// A [`DisplaySource`] backed by a replaceable in-memory list.
///
/// Used by the synthetic backend and to simulate monitor hot-plug.
#[derive(Default)]
pub struct StaticDisplays {
    displays: Mutex<Vec<DisplayInfo>>,
}

impl StaticDisplays {
    pub fn new(displays: Vec<DisplayInfo>) -> Self {
        Self {
            displays: Mutex::new(displays),
        }
    }

    /// Replace the list returned by the next enumeration.
    pub fn set(&self, displays: Vec<DisplayInfo>) {
        *self.displays.lock().unwrap_or_else(PoisonError::into_inner) = displays;
    }
}

impl DisplaySource for StaticDisplays {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>> {
        let displays = self
            .displays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if displays.is_empty() {
            return Err(DeskcastError::NoDisplays);
        }
        Ok(displays)
    }
}

#[cfg(test)]
pub(crate) fn test_display(name: &str, area: MonitorArea, is_primary: bool) -> DisplayInfo {
    DisplayInfo {
        device_name: name.to_string(),
        display_name: format!("Display {name}"),
        monitor_area: area,
        is_primary,
        scale_factor: 1.0,
    }
}
