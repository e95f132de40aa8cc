//! Wire format of the upstream protocol.
//!
//! Every logical message travels in its own frame:
//!
//! ```text
//! [Length: u32 BE][Body: Length bytes]
//! ```
//!
//! Connector to upstream, fixed-size command bodies:
//! - `SEEK`:      `[2][offset: i64]`
//! - `COMMITTED`: `[3][offset: i64]`
//! - `WINDOWED`:  `[7][events: u32][idle: u32]`
//!
//! Upstream to connector, one event per frame:
//! - data:        `[offset: i64][payload bytes]`
//!
//! All integers are big-endian with no padding.

use super::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

const SEEK: u8 = 2;
const COMMITTED: u8 = 3;
const WINDOWED: u8 = 7;

const LENGTH_PREFIX: usize = 4;
const OFFSET_LEN: usize = 8;

/// Control command sent from the connector to the upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Resume replay from `offset` (0 = from the beginning).
    Seek { offset: i64 },
    /// Flow statistics of one window.
    Windowed { event_count: u32, idle_count: u32 },
    /// Upstream may discard data up to `offset`.
    Committed { offset: i64 },
}

impl Command {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Seek { .. } => SEEK,
            Self::Windowed { .. } => WINDOWED,
            Self::Committed { .. } => COMMITTED,
        }
    }

    /// Size of the encoded body (tag included, length prefix excluded).
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Seek { .. } | Self::Committed { .. } => 1 + OFFSET_LEN,
            Self::Windowed { .. } => 1 + 4 + 4,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.tag());
        match *self {
            Self::Seek { offset } | Self::Committed { offset } => dst.put_i64(offset),
            Self::Windowed {
                event_count,
                idle_count,
            } => {
                dst.put_u32(event_count);
                dst.put_u32(idle_count);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one command body. The body must contain exactly one command.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.is_empty() {
            return Err(Error::Protocol("empty command".to_string()));
        }
        let tag = src.get_u8();
        let expected = match tag {
            SEEK | COMMITTED => OFFSET_LEN,
            WINDOWED => 8,
            other => return Err(Error::Protocol(format!("unknown command tag {}", other))),
        };
        if src.len() != expected {
            return Err(Error::Protocol(format!(
                "command tag {} needs {} body bytes, got {}",
                tag,
                expected,
                src.len()
            )));
        }
        Ok(match tag {
            SEEK => Self::Seek {
                offset: src.get_i64(),
            },
            COMMITTED => Self::Committed {
                offset: src.get_i64(),
            },
            _ => Self::Windowed {
                event_count: src.get_u32(),
                idle_count: src.get_u32(),
            },
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seek { offset } => write!(f, "SEEK({})", offset),
            Self::Windowed {
                event_count,
                idle_count,
            } => write!(f, "WINDOWED({}, {})", event_count, idle_count),
            Self::Committed { offset } => write!(f, "COMMITTED({})", offset),
        }
    }
}

/// One event from the upstream source with the stream offset it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub offset: i64,
    pub payload: Bytes,
}

impl DataMessage {
    pub fn new(offset: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            offset,
            payload: payload.into(),
        }
    }

    /// Split a data frame into its offset header and payload.
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < OFFSET_LEN {
            return Err(Error::Protocol(format!(
                "data message of {} bytes is shorter than its offset header",
                frame.len()
            )));
        }
        let offset = frame.get_i64();
        Ok(Self {
            offset,
            payload: frame,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(OFFSET_LEN + self.payload.len());
        dst.put_i64(self.offset);
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OFFSET_LEN + self.payload.len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Length-prefixed framing for the upstream socket.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek at the length without consuming
        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        trace!(length, "decoded frame");
        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame size {} exceeds maximum {}",
                item.len(),
                self.max_frame_size
            )));
        }
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.put(item);
        Ok(())
    }
}
