//! Monitor enumeration via `EnumDisplayMonitors`.

use std::mem::size_of;

use windows::Win32::Foundation::{BOOL, LPARAM, RECT, TRUE};
use windows::Win32::Graphics::Gdi::{
    DISPLAY_DEVICEW, EnumDisplayDevicesW, EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR,
    MONITORINFO, MONITORINFOEXW,
};
use windows::Win32::UI::HiDpi::{GetDpiForMonitor, MDT_EFFECTIVE_DPI};
use windows::Win32::UI::WindowsAndMessaging::MONITORINFOF_PRIMARY;
use windows::core::PCWSTR;

use super::dxgi::wide_to_string;
use crate::display::{DisplayInfo, DisplaySource};
use crate::error::{DeskcastError, Result};
use crate::types::MonitorArea;

/// Lists the monitors attached to the interactive desktop.
#[derive(Debug, Default)]
pub struct WindowsDisplays;

unsafe extern "system" fn collect_monitor(
    monitor: HMONITOR,
    _hdc: HDC,
    _rect: *mut RECT,
    data: LPARAM,
) -> BOOL {
    let monitors = unsafe { &mut *(data.0 as *mut Vec<HMONITOR>) };
    monitors.push(monitor);
    TRUE
}

impl DisplaySource for WindowsDisplays {
    fn enumerate(&self) -> Result<Vec<DisplayInfo>> {
        let mut monitors: Vec<HMONITOR> = Vec::new();
        unsafe {
            EnumDisplayMonitors(
                HDC::default(),
                None,
                Some(collect_monitor),
                LPARAM(&mut monitors as *mut Vec<HMONITOR> as isize),
            )
            .ok()
            .map_err(|e| DeskcastError::Capture(format!("EnumDisplayMonitors failed: {e}")))?;
        }

        let displays: Vec<DisplayInfo> = monitors.into_iter().filter_map(describe).collect();
        if displays.is_empty() {
            return Err(DeskcastError::NoDisplays);
        }
        Ok(displays)
    }
}

fn describe(monitor: HMONITOR) -> Option<DisplayInfo> {
    let mut info = MONITORINFOEXW::default();
    info.monitorInfo.cbSize = size_of::<MONITORINFOEXW>() as u32;
    unsafe {
        if !GetMonitorInfoW(monitor, &mut info.monitorInfo as *mut MONITORINFO).as_bool() {
            return None;
        }
    }

    let device_name = wide_to_string(&info.szDevice);
    let rc = info.monitorInfo.rcMonitor;

    let mut dpi_x = 96u32;
    let mut dpi_y = 96u32;
    let scale_factor = unsafe {
        match GetDpiForMonitor(monitor, MDT_EFFECTIVE_DPI, &mut dpi_x, &mut dpi_y) {
            Ok(()) => dpi_x as f64 / 96.0,
            Err(_) => 1.0,
        }
    };

    Some(DisplayInfo {
        display_name: friendly_name(&info.szDevice).unwrap_or_else(|| device_name.clone()),
        device_name,
        monitor_area: MonitorArea::new(
            rc.left,
            rc.top,
            (rc.right - rc.left).max(0) as u32,
            (rc.bottom - rc.top).max(0) as u32,
        ),
        is_primary: info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0,
        scale_factor,
    })
}

/// Monitor model string for an adapter device name.
fn friendly_name(device: &[u16]) -> Option<String> {
    let mut dd = DISPLAY_DEVICEW {
        cb: size_of::<DISPLAY_DEVICEW>() as u32,
        ..Default::default()
    };
    let found = unsafe { EnumDisplayDevicesW(PCWSTR(device.as_ptr()), 0, &mut dd, 0).as_bool() };
    if !found {
        return None;
    }
    let name = wide_to_string(&dd.DeviceString);
    (!name.is_empty()).then_some(name)
}
