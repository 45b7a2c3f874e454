//! Native platform integrations.

#[cfg(target_os = "windows")]
pub mod win32;
