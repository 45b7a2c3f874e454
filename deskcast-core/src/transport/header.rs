//! Fixed 24-byte frame header.
//!
//! ```text
//!  0      4      6      8          12                 20         24
//!  +------+------+------+----------+------------------+----------+
//!  | DKC1 | kind | flags| len  u32 | checksum     u64 | reserved |
//!  +------+------+------+----------+------------------+----------+
//! ```
//!
//! All integers are little-endian. `checksum` is the first eight bytes
//! of the payload's BLAKE3 hash.

use bitflags::bitflags;

use crate::error::{DeskcastError, Result};

pub const MAGIC: [u8; 4] = *b"DKC1";
pub const HEADER_SIZE: usize = 24;

pub type HeaderBytes = [u8; HEADER_SIZE];

bitflags! {
    /// Per-frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u16 {
        /// The payload is a full-frame region.
        const KEYFRAME = 0x0001;
    }
}

/// Payload type carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    Region = 1,
    Metrics = 2,
    Displays = 3,
    SelectDisplay = 4,
    RequestKeyframe = 5,
    Heartbeat = 6,
}

impl TryFrom<u16> for MessageKind {
    type Error = DeskcastError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            1 => MessageKind::Region,
            2 => MessageKind::Metrics,
            3 => MessageKind::Displays,
            4 => MessageKind::SelectDisplay,
            5 => MessageKind::RequestKeyframe,
            6 => MessageKind::Heartbeat,
            other => {
                return Err(DeskcastError::UnknownVariant {
                    type_name: "MessageKind",
                    value: other as u64,
                });
            }
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Truncated BLAKE3 of `payload`.
pub fn checksum(payload: &[u8]) -> u64 {
    let hash = blake3::hash(payload);
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageKind,
    pub flags: FrameFlags,
    pub payload_len: u32,
    pub checksum: u64,
}

impl FrameHeader {
    /// Header for `payload`, checksum included.
    pub fn for_payload(kind: MessageKind, flags: FrameFlags, payload: &[u8]) -> Result<Self> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| DeskcastError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        Ok(Self {
            kind,
            flags,
            payload_len,
            checksum: checksum(payload),
        })
    }

    pub fn to_bytes(&self) -> HeaderBytes {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..6].copy_from_slice(&(self.kind as u16).to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        out[12..20].copy_from_slice(&self.checksum.to_le_bytes());
        // 20..24 reserved, zero.
        out
    }

    pub fn from_bytes(bytes: &HeaderBytes) -> Result<Self> {
        if bytes[0..4] != MAGIC {
            return Err(DeskcastError::InvalidMagic);
        }
        let kind = u16::from_le_bytes([bytes[4], bytes[5]]);
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        let payload_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&bytes[12..20]);

        Ok(Self {
            kind: MessageKind::try_from(kind)?,
            flags: FrameFlags::from_bits_truncate(flags),
            payload_len,
            checksum: u64::from_le_bytes(checksum),
        })
    }

    pub fn verify(&self, payload: &[u8]) -> Result<()> {
        if checksum(payload) != self.checksum {
            return Err(DeskcastError::ChecksumMismatch);
        }
        Ok(())
    }
}
