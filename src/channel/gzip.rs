use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

use super::interceptor::{Interceptor, Next};
use super::message::ChannelMessage;
use super::options::SendOptions;
use crate::error::Result;
use crate::membership::types::Member;

/// Gzip-compresses payloads of messages sent with [`SendOptions::COMPRESSED`].
#[derive(Debug, Clone)]
pub struct GzipInterceptor {
    level: Compression,
}

impl GzipInterceptor {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn compress(data: &[u8], level: Compression) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 16), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[async_trait]
impl Interceptor for GzipInterceptor {
    fn name(&self) -> &str {
        "gzip"
    }

    fn option_flag(&self) -> u32 {
        SendOptions::COMPRESSED.bits()
    }

    async fn send(
        &self,
        message: ChannelMessage,
        destinations: Vec<Member>,
        next: Next,
    ) -> Result<()> {
        let compressed = compress(&message.payload, self.level)?;
        tracing::trace!(
            "Compressed {} -> {} bytes",
            message.payload.len(),
            compressed.len()
        );
        next.send(message.with_payload(Bytes::from(compressed)), destinations)
            .await
    }

    async fn receive(&self, message: ChannelMessage, next: Next) -> Result<()> {
        let restored = decompress(&message.payload)?;
        next.receive(message.with_payload(Bytes::from(restored))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_restores_payload() {
        let text = "replicated ".repeat(200);
        let packed = compress(text.as_bytes(), Compression::default()).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(decompress(&packed).unwrap(), text.as_bytes());
    }

    #[test]
    fn test_decompress_rejects_plain_bytes() {
        assert!(decompress(b"not gzip at all").is_err());
    }
}
