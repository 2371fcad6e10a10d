//! Length-prefixed framed envelope shared by every shardpilot connection.
//!
//! Layout, all fields big-endian:
//!
//! ```text
//! offset  size  field
//!   0      2    magic
//!   2      2    version
//!   4      4    body length
//!   8      8    message id (chosen by the writer)
//!  16      L    protobuf body
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const MSG_MAGIC: u16 = 0xdaf4;
pub const MSG_VERSION: u16 = 1;
pub const MSG_HEADER_SIZE: usize = 16;

/// Upper bound on a frame body. Anything larger is a framing error rather
/// than an allocation request.
pub const MAX_MSG_BODY: usize = 16 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame magic 0x{0:04x}")]
    BadMagic(u16),
    #[error("frame body of {0} bytes exceeds the {1} byte cap")]
    Oversize(usize, usize),
    #[error("message decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One framed message: the writer-chosen id plus the raw protobuf body.
#[derive(Clone, Debug)]
pub struct Frame {
    pub msg_id: u64,
    pub body: Bytes,
}

impl Frame {
    /// Marshal `msg` into a frame carrying `msg_id`.
    pub fn from_msg<M: Message>(msg_id: u64, msg: &M) -> Frame {
        Frame {
            msg_id,
            body: Bytes::from(msg.encode_to_vec()),
        }
    }

    /// Unmarshal the body into a concrete message type.
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.body.as_ref())?)
    }
}

/// Codec for [`Frame`]s over a byte stream.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_body: usize,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec {
            max_body: MAX_MSG_BODY,
        }
    }

    pub fn with_max_body(max_body: usize) -> FrameCodec {
        FrameCodec { max_body }
    }
}

impl Default for FrameCodec {
    fn default() -> FrameCodec {
        FrameCodec::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < MSG_HEADER_SIZE {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([src[0], src[1]]);
        if magic != MSG_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let body_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if body_len > self.max_body {
            return Err(FrameError::Oversize(body_len, self.max_body));
        }
        if src.len() < MSG_HEADER_SIZE + body_len {
            src.reserve(MSG_HEADER_SIZE + body_len - src.len());
            return Ok(None);
        }

        let header = src.split_to(MSG_HEADER_SIZE);
        let msg_id = u64::from_be_bytes([
            header[8], header[9], header[10], header[11], header[12], header[13], header[14],
            header[15],
        ]);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Frame { msg_id, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.body.len() > self.max_body {
            return Err(FrameError::Oversize(frame.body.len(), self.max_body));
        }

        dst.reserve(MSG_HEADER_SIZE + frame.body.len());
        dst.put_u16(MSG_MAGIC);
        dst.put_u16(MSG_VERSION);
        dst.put_u32(frame.body.len() as u32);
        dst.put_u64(frame.msg_id);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Timestamp;

    #[test]
    fn roundtrip() {
        let msg = Timestamp {
            physical: 42,
            logical: 7,
        };
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::from_msg(99, &msg), &mut buf)
            .expect("encode");

        let frame = codec.decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(frame.msg_id, 99);
        assert_eq!(frame.decode::<Timestamp>().expect("body"), msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let msg = Timestamp {
            physical: 1,
            logical: 2,
        };
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        codec
            .encode(Frame::from_msg(1, &msg), &mut encoded)
            .expect("encode");

        let mut buf = BytesMut::new();
        let (last, rest) = encoded.split_last().expect("non-empty frame");
        buf.extend_from_slice(rest);
        assert!(codec.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(&[*last]);
        let frame = codec.decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(frame.msg_id, 1);
        assert_eq!(frame.decode::<Timestamp>().expect("body"), msg);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(0xbeef);
        buf.put_u16(MSG_VERSION);
        buf.put_u32(0);
        buf.put_u64(1);
        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::BadMagic(0xbeef))
        ));
    }

    #[test]
    fn oversize_body_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(MSG_MAGIC);
        buf.put_u16(MSG_VERSION);
        buf.put_u32(1024);
        buf.put_u64(1);
        let mut codec = FrameCodec::with_max_body(16);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Oversize(1024, 16))
        ));
    }
}
