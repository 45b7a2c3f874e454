//! # deskcast-agent
//!
//! Host-side service that captures the local desktop with
//! `deskcast-core` and streams changed regions to one connected viewer
//! over TCP. The viewer can pick the display to capture and ask for a
//! fresh keyframe; capture quality adapts to measured throughput.

pub mod config;
pub mod service;
