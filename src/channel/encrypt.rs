//! AES-GCM encryption of payloads sent with [`SendOptions::SECURE`].
//!
//! Wire layout of an encrypted payload: `[nonce:12][ciphertext + tag:16]`. Every member of
//! the group must be configured with the same key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use async_trait::async_trait;
use bytes::Bytes;

use super::interceptor::{Interceptor, Next};
use super::message::ChannelMessage;
use super::options::SendOptions;
use crate::error::{ClusterError, Result};
use crate::membership::types::Member;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

enum Cipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

pub struct EncryptInterceptor {
    cipher: Cipher,
}

impl EncryptInterceptor {
    /// Raw key of 16 bytes (AES-128) or 32 bytes (AES-256).
    pub fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| ClusterError::Configuration(format!("invalid encryption key length {}", key.len()));
        let cipher = match key.len() {
            16 => Cipher::Aes128(Box::new(Aes128Gcm::new_from_slice(key).map_err(invalid)?)),
            32 => Cipher::Aes256(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?)),
            other => {
                return Err(ClusterError::Configuration(format!(
                    "encryption key must be 16 or 32 bytes, got {}",
                    other
                )));
            }
        };
        Ok(Self { cipher })
    }

    /// Hex-encoded key, as written in the `[channel]` configuration.
    pub fn from_hex(key: &str) -> Result<Self> {
        let raw = hex::decode(key.trim())
            .map_err(|e| ClusterError::Configuration(format!("encryption key is not hex: {}", e)))?;
        Self::new(&raw)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|e| ClusterError::Crypto(format!("encrypt: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(ClusterError::Crypto(format!(
                "ciphertext of {} bytes is too short",
                data.len()
            )));
        }
        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(nonce, sealed),
            Cipher::Aes256(c) => c.decrypt(nonce, sealed),
        }
        .map_err(|e| ClusterError::Crypto(format!("decrypt: {}", e)))
    }
}

#[async_trait]
impl Interceptor for EncryptInterceptor {
    fn name(&self) -> &str {
        "encrypt"
    }

    fn option_flag(&self) -> u32 {
        SendOptions::SECURE.bits()
    }

    async fn send(
        &self,
        message: ChannelMessage,
        destinations: Vec<Member>,
        next: Next,
    ) -> Result<()> {
        let sealed = self.encrypt(&message.payload)?;
        next.send(message.with_payload(Bytes::from(sealed)), destinations)
            .await
    }

    async fn receive(&self, message: ChannelMessage, next: Next) -> Result<()> {
        let opened = match self.decrypt(&message.payload) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(
                    "Dropping message {} from {}: {}",
                    message.id,
                    message.source.name(),
                    e
                );
                return Err(e);
            }
        };
        next.receive(message.with_payload(Bytes::from(opened))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_encrypt_restores_payload() {
        let stage = EncryptInterceptor::from_hex(KEY).unwrap();
        let sealed = stage.encrypt(b"session attributes").unwrap();

        assert_eq!(sealed.len(), NONCE_LEN + b"session attributes".len() + TAG_LEN);
        assert!(!sealed.windows(7).any(|w| w == b"session"));
        assert_eq!(stage.decrypt(&sealed).unwrap(), b"session attributes");
    }

    #[test]
    fn test_same_plaintext_gets_fresh_nonce() {
        let stage = EncryptInterceptor::new(&[7u8; 16]).unwrap();
        assert_ne!(stage.encrypt(b"x").unwrap(), stage.encrypt(b"x").unwrap());
    }

    #[test]
    fn test_wrong_key_and_tampering_rejected() {
        let stage = EncryptInterceptor::from_hex(KEY).unwrap();
        let other = EncryptInterceptor::new(&[9u8; 32]).unwrap();
        let mut sealed = stage.encrypt(b"payload").unwrap();

        assert!(matches!(other.decrypt(&sealed), Err(ClusterError::Crypto(_))));
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(stage.decrypt(&sealed), Err(ClusterError::Crypto(_))));
        assert!(stage.decrypt(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_bad_keys_are_configuration_errors() {
        assert!(matches!(
            EncryptInterceptor::new(&[0u8; 20]),
            Err(ClusterError::Configuration(_))
        ));
        assert!(matches!(
            EncryptInterceptor::from_hex("zz"),
            Err(ClusterError::Configuration(_))
        ));
    }
}
