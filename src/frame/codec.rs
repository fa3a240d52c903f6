use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{Frame, FrameHeader, MAX_PAYLOAD_SIZE};
use crate::error::FrameError;

/// Most buffer a single decode call reserves for a pending payload.
const MAX_RESERVE: usize = 64 * 1024;

#[derive(Debug)]
enum DecodeState {
    Head,
    Payload(FrameHeader),
}

/// `tokio_util` codec for duplex frames. The payload limit is enforced in
/// both directions and is checked before any payload byte is buffered.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
    max_payload_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload_size(MAX_PAYLOAD_SIZE)
    }

    /// Limits above [`MAX_PAYLOAD_SIZE`] are clamped.
    pub fn with_max_payload_size(max_payload_size: u32) -> Self {
        Self {
            state: DecodeState::Head,
            max_payload_size: max_payload_size.min(MAX_PAYLOAD_SIZE),
        }
    }

    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_payload_size as usize {
            return Err(FrameError::PayloadTooLarge {
                size: u32::try_from(len).unwrap_or(u32::MAX),
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let header = match std::mem::replace(&mut self.state, DecodeState::Head) {
            DecodeState::Payload(header) => header,
            DecodeState::Head => {
                let Some(header) = FrameHeader::decode(src)? else {
                    return Ok(None);
                };
                self.check_len(header.payload_len as usize)?;
                header
            }
        };

        let len = header.payload_len as usize;
        if src.len() < len {
            src.reserve((len - src.len()).min(MAX_RESERVE));
            self.state = DecodeState::Payload(header);
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.check_len(frame.payload.len())?;
        dst.reserve(frame.wire_len());
        frame.header.encode(dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Flags, FrameType, HEADER_SIZE};
    use bytes::{BufMut, Bytes};

    /// Header announcing `len` payload bytes, without the payload.
    fn announce(msg_type: u8, len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0xA7, 0xC4, 0x01, msg_type, 0x00]);
        buf.put_u64(3);
        buf.put_u32(len);
        buf
    }

    #[test]
    fn layout() {
        let mut buf = BytesMut::new();
        let frame = Frame::new(
            FrameType::Shutdown,
            Flags::from_raw(0x80),
            u64::MAX,
            Bytes::from_static(b"xy"),
        );
        FrameCodec::new().encode(frame, &mut buf).unwrap();

        assert_eq!(HEADER_SIZE, 17);
        assert_eq!(buf.len(), 19);
        assert_eq!(&buf[..5], &[0xA7, 0xC4, 0x01, 0x05, 0x80]);
        assert_eq!(&buf[5..13], &[0xFF; 8]);
        assert_eq!(&buf[13..17], &[0, 0, 0, 2]);
        assert_eq!(&buf[17..], b"xy");
    }

    #[test]
    fn payload_split_across_reads() {
        let mut codec = FrameCodec::new();
        let frame = Frame::heartbeat(7, Bytes::from(vec![0x5Au8; 100]));
        let mut wire = BytesMut::new();
        codec.encode(frame.clone(), &mut wire).unwrap();

        let mut buf = wire.split_to(HEADER_SIZE + 40);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 40);

        buf.extend_from_slice(&wire);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = announce(0x06, 0);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(FrameError::UnknownMessageType(0x06))
        ));
    }

    #[test]
    fn limit_applies_both_ways() {
        let mut codec = FrameCodec::with_max_payload_size(1024);
        let mut buf = announce(FrameType::Data as u8, 2048);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::PayloadTooLarge {
                size: 2048,
                max: 1024
            })
        ));

        let oversized = Frame::data(0, Bytes::from(vec![0u8; 2048]));
        assert!(codec.encode(oversized, &mut BytesMut::new()).is_err());
        assert_eq!(
            FrameCodec::with_max_payload_size(u32::MAX).max_payload_size(),
            MAX_PAYLOAD_SIZE
        );
    }

    #[test]
    fn absurd_length_is_rejected() {
        let mut buf = announce(FrameType::Data as u8, u32::MAX);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn reservation_is_bounded() {
        let mut codec = FrameCodec::new();
        let mut buf = announce(FrameType::Data as u8, 8 * 1024 * 1024);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() < 1024 * 1024);
    }
}
