//! Stream framing: `[length:u32][option-flags:u32][payload]`, big-endian.
//!
//! `length` counts payload bytes only. The top bit of the flags word is reserved for
//! transport acknowledgements and never set by a send option.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ClusterError, Result};

pub const FRAME_HEADER_LEN: usize = 8;
pub const ACK_FLAG: u32 = 0x8000_0000;
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const ACK_OK: u8 = 0x01;
const ACK_FAILED: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            flags: flags & !ACK_FLAG,
            payload: payload.into(),
        }
    }

    pub fn ack(ok: bool) -> Self {
        Self {
            flags: ACK_FLAG,
            payload: Bytes::from_static(if ok { &[ACK_OK] } else { &[ACK_FAILED] }),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & ACK_FLAG != 0
    }

    /// For ack frames: whether the receiver reported success.
    pub fn ack_ok(&self) -> bool {
        self.is_ack() && self.payload.first() == Some(&ACK_OK)
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        put_frame(&mut out, self);
        out.to_vec()
    }

    /// Decodes exactly one frame from a complete buffer (datagram path).
    pub fn from_bytes(data: &[u8]) -> Result<Frame> {
        let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_LEN);
        let mut buf = BytesMut::from(data);
        let frame = codec
            .decode(&mut buf)?
            .ok_or_else(|| ClusterError::Frame("truncated frame".to_string()))?;
        if !buf.is_empty() {
            return Err(ClusterError::Frame(format!(
                "{} trailing bytes after frame",
                buf.len()
            )));
        }
        Ok(frame)
    }
}

fn put_frame(dst: &mut BytesMut, frame: &Frame) {
    dst.reserve(frame.encoded_len());
    dst.put_u32(frame.payload.len() as u32);
    dst.put_u32(frame.flags);
    dst.put_slice(&frame.payload);
}

/// Reassembles frames from a byte stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ClusterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_len {
            return Err(ClusterError::Frame(format!(
                "frame of {} bytes exceeds max {}",
                len, self.max_frame_len
            )));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let flags = src.get_u32();
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { flags, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ClusterError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_frame_len {
            return Err(ClusterError::Frame(format!(
                "frame of {} bytes exceeds max {}",
                frame.payload.len(),
                self.max_frame_len
            )));
        }
        put_frame(dst, &frame);
        Ok(())
    }
}
