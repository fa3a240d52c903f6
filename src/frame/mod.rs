//! Wire format of the Secure Duplex Codec.
//!
//! ```text
//! magic:u16 | version:u8 | type:u8 | flags:u8 | sequence:u64 | len:u32 | payload
//! ```
//!
//! All integers are big-endian. The payload of every frame is sealed; the
//! header travels in clear but is bound into the AEAD associated data.

pub mod codec;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// First two bytes of every frame.
pub const MAGIC: u16 = 0xA7C4;

pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 2 + 1 + 1 + 1 + 8 + 4;

/// Hard ceiling on a frame payload (16 MiB). Codecs may be configured lower.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Application bytes.
    Data = 0x02,
    /// Keep-alive, empty plaintext.
    Heartbeat = 0x04,
    /// Sender half-close, empty plaintext.
    Shutdown = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, FrameError> {
        Ok(match byte {
            0x02 => Self::Data,
            0x04 => Self::Heartbeat,
            0x05 => Self::Shutdown,
            other => return Err(FrameError::UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Heartbeat => "heartbeat",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Reserved flag byte. Version 1 assigns no bits, but whatever the sender
/// put there is authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: FrameType,
    pub flags: Flags,
    pub sequence: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(MAGIC);
        dst.put_u8(self.version);
        dst.put_u8(self.msg_type as u8);
        dst.put_u8(self.flags.raw());
        dst.put_u64(self.sequence);
        dst.put_u32(self.payload_len);
    }

    /// Parse a header off the front of `src`.
    ///
    /// Yields `None` and consumes nothing while fewer than [`HEADER_SIZE`]
    /// bytes are buffered. On success exactly the header is consumed.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut head = &src[..HEADER_SIZE];
        let magic = head.get_u16();
        if magic != MAGIC {
            return Err(FrameError::InvalidMagic(magic));
        }
        let version = head.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let msg_type = FrameType::try_from(head.get_u8())?;
        let flags = Flags::from_raw(head.get_u8());
        let sequence = head.get_u64();
        let payload_len = head.get_u32();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        src.advance(HEADER_SIZE);
        Ok(Some(Self {
            version,
            msg_type,
            flags,
            sequence,
            payload_len,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Wrap an already sealed payload.
    pub fn new(msg_type: FrameType, flags: Flags, sequence: u64, payload: Bytes) -> Self {
        let header = FrameHeader {
            version: PROTOCOL_VERSION,
            msg_type,
            flags,
            sequence,
            payload_len: payload.len() as u32,
        };
        Self { header, payload }
    }

    pub fn data(sequence: u64, payload: Bytes) -> Self {
        Self::new(FrameType::Data, Flags::empty(), sequence, payload)
    }

    pub fn heartbeat(sequence: u64, payload: Bytes) -> Self {
        Self::new(FrameType::Heartbeat, Flags::empty(), sequence, payload)
    }

    pub fn shutdown(sequence: u64, payload: Bytes) -> Self {
        Self::new(FrameType::Shutdown, Flags::empty(), sequence, payload)
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}
