//! `tokio_util` codec for [`Message`] frames.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::header::{FrameHeader, HEADER_SIZE, HeaderBytes};
use super::message::Message;
use crate::error::{DeskcastError, Result};

/// Largest payload either side accepts.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeskcastCodec;

impl Decoder for DeskcastCodec {
    type Item = Message;
    type Error = DeskcastError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut raw: HeaderBytes = [0; HEADER_SIZE];
        raw.copy_from_slice(&src[..HEADER_SIZE]);
        let header = FrameHeader::from_bytes(&raw)?;

        let payload_len = header.payload_len as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(DeskcastError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len);
        header.verify(&payload)?;
        Message::decode_payload(header.kind, &payload).map(Some)
    }
}

impl Encoder<Message> for DeskcastCodec {
    type Error = DeskcastError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = item.encode_payload()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(DeskcastError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = FrameHeader::for_payload(item.kind(), item.flags(), &payload)?;
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}
