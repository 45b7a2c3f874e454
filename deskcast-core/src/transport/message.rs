//! Messages exchanged with a viewer.
//!
//! ```text
//! Agent  ──[Region]──────────► Viewer   (per payload, KEYFRAME flag on full frames)
//! Agent  ──[Metrics]─────────► Viewer   (every broadcast interval)
//! Agent  ──[Displays]────────► Viewer   (on connect and when the list changes)
//! Viewer ──[SelectDisplay]───► Agent
//! Viewer ──[RequestKeyframe]─► Agent
//! either ──[Heartbeat]───────► either
//! ```
//!
//! Payloads are bincode; the header's `kind` says which type follows.

use serde::de::DeserializeOwned;

use super::header::{FrameFlags, MessageKind};
use crate::bandwidth::MetricsSnapshot;
use crate::channel::ScreenRegionPayload;
use crate::display::DisplayInfo;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Region(ScreenRegionPayload),
    Metrics(MetricsSnapshot),
    Displays(Vec<DisplayInfo>),
    SelectDisplay(String),
    RequestKeyframe,
    Heartbeat,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Region(_) => MessageKind::Region,
            Message::Metrics(_) => MessageKind::Metrics,
            Message::Displays(_) => MessageKind::Displays,
            Message::SelectDisplay(_) => MessageKind::SelectDisplay,
            Message::RequestKeyframe => MessageKind::RequestKeyframe,
            Message::Heartbeat => MessageKind::Heartbeat,
        }
    }

    pub fn flags(&self) -> FrameFlags {
        match self {
            Message::Region(region) if region.is_keyframe => FrameFlags::KEYFRAME,
            _ => FrameFlags::empty(),
        }
    }

    /// Serialise the body. Unit messages have an empty payload.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Message::Region(region) => bincode::serialize(region)?,
            Message::Metrics(snapshot) => bincode::serialize(snapshot)?,
            Message::Displays(displays) => bincode::serialize(displays)?,
            Message::SelectDisplay(name) => bincode::serialize(name)?,
            Message::RequestKeyframe | Message::Heartbeat => Vec::new(),
        })
    }

    pub fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Self> {
        Ok(match kind {
            MessageKind::Region => Message::Region(decode(payload)?),
            MessageKind::Metrics => Message::Metrics(decode(payload)?),
            MessageKind::Displays => Message::Displays(decode(payload)?),
            MessageKind::SelectDisplay => Message::SelectDisplay(decode(payload)?),
            MessageKind::RequestKeyframe => Message::RequestKeyframe,
            MessageKind::Heartbeat => Message::Heartbeat,
        })
    }
}

impl From<ScreenRegionPayload> for Message {
    fn from(region: ScreenRegionPayload) -> Self {
        Message::Region(region)
    }
}

impl From<MetricsSnapshot> for Message {
    fn from(snapshot: MetricsSnapshot) -> Self {
        Message::Metrics(snapshot)
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}
