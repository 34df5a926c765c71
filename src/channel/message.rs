use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::options::SendOptions;
use crate::error::Result;
use crate::membership::types::{Member, now_ms};
use crate::transport::frame::Frame;

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    pub fn new() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// A message travelling through the interceptor stack.
///
/// Stages take it by value and may rewrite `payload` (compression, sequence numbers) before
/// handing it on. `options` is not part of the envelope: it travels in the frame header.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub source: Member,
    pub payload: Bytes,
    pub options: SendOptions,
    pub id: MessageId,
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    source: Member,
    id: MessageId,
    timestamp_ms: u64,
    payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn new(source: Member, payload: impl Into<Bytes>, options: SendOptions) -> Self {
        Self {
            source,
            payload: payload.into(),
            options,
            id: MessageId::new(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn to_frame(&self) -> Result<Frame> {
        let envelope = Envelope {
            source: self.source.clone(),
            id: self.id,
            timestamp_ms: self.timestamp_ms,
            payload: self.payload.to_vec(),
        };
        Ok(Frame::new(self.options.bits(), bincode::serialize(&envelope)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let envelope: Envelope = bincode::deserialize(&frame.payload)?;
        Ok(Self {
            source: envelope.source,
            payload: Bytes::from(envelope.payload),
            options: SendOptions::from_bits(frame.flags),
            id: envelope.id,
            timestamp_ms: envelope.timestamp_ms,
        })
    }
}
