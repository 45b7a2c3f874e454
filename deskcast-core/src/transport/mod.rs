//! Delivery of frames and telemetry to a viewer over TCP.
//!
//! | Module       | Purpose                                        |
//! |--------------|------------------------------------------------|
//! | `header`     | 24-byte frame header, flags, checksum         |
//! | `message`    | [`Message`] enum and bincode payloads         |
//! | `codec`      | `tokio_util` encoder/decoder                  |
//! | `connection` | Framed TCP connection with heartbeat          |

pub mod codec;
pub mod connection;
pub mod header;
pub mod message;

pub use codec::{DeskcastCodec, MAX_PAYLOAD_SIZE};
pub use connection::{ConnectionSender, HEARTBEAT_INTERVAL, ViewerConnection};
pub use header::{FrameFlags, FrameHeader, HEADER_SIZE, MessageKind};
pub use message::Message;
