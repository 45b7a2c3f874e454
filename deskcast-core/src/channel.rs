//! Single-slot frame channel between the capture loop and its consumer.
//!
//! Capacity is one: the producer must [`reserve`](FrameSender::reserve) a
//! slot before capturing, so a slow consumer suspends capture instead of
//! letting encoded frames pile up.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{DeskcastError, Result};
use crate::types::Rect;

/// One encoded screen region, positioned in frame coordinates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRegionPayload {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub is_keyframe: bool,
    pub data: Vec<u8>,
}

impl ScreenRegionPayload {
    pub fn new(region: Rect, is_keyframe: bool, data: Vec<u8>) -> Self {
        Self {
            x: region.x,
            y: region.y,
            width: region.width,
            height: region.height,
            is_keyframe,
            data,
        }
    }

    pub fn region(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

impl std::fmt::Debug for ScreenRegionPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenRegionPayload")
            .field("x", &self.x)
            .field("y", &self.y)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("is_keyframe", &self.is_keyframe)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Create a connected sender/stream pair with a single buffered slot.
pub fn frame_channel() -> (FrameSender, FrameStream) {
    let (tx, rx) = mpsc::channel(1);
    (FrameSender { tx }, FrameStream { rx })
}

// ── Sender ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<ScreenRegionPayload>,
}

impl FrameSender {
    /// Wait for the slot to be free. Fails once the stream is dropped.
    pub async fn reserve(&self) -> Result<FrameSlot> {
        let permit = self
            .tx
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| DeskcastError::ChannelClosed)?;
        Ok(FrameSlot { permit })
    }
}

/// A reserved slot. Dropping it without sending frees the slot again.
#[derive(Debug)]
pub struct FrameSlot {
    permit: mpsc::OwnedPermit<ScreenRegionPayload>,
}

impl FrameSlot {
    pub fn send(self, payload: ScreenRegionPayload) {
        self.permit.send(payload);
    }
}

// ── Stream ───────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FrameStream {
    rx: mpsc::Receiver<ScreenRegionPayload>,
}

impl FrameStream {
    /// Next payload, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ScreenRegionPayload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ScreenRegionPayload> {
        self.rx.try_recv().ok()
    }
}

impl Stream for FrameStream {
    type Item = ScreenRegionPayload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
