//! Per-packet sealing and opening for the framed channel.
//!
//! Wire layout of one packet: `u32_be length ∥ nonce[12] ∥ ciphertext+tag` in
//! encrypted mode, `u32_be length ∥ payload` in unencrypted mode. When a padding
//! policy is active, the plaintext under the AEAD is
//! `u16_be body_len ∥ body ∥ padding`; without one, the body is carried verbatim
//! and both peers must agree on that out of band.

use aes_gcm::aead::Aead as _;
use aes_gcm::{Aes256Gcm, Key, KeyInit as _, Nonce};
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

use crate::obfs::PaddingPolicy;

/// Hard upper bound on a single packet's payload. Readers reject anything
/// larger before allocating.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Largest body one packet can carry; bounded by the `u16` length prefix.
pub const MAX_CHUNK_LEN: usize = u16::MAX as usize;

/// Derives the AES-256 key from the shared secret.
pub fn derive_key(psk: &str) -> [u8; 32] {
    Sha256::digest(psk.as_bytes()).into()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} outside 1..={MAX_FRAME_LEN}")]
    BadLength(usize),
    #[error("frame too short for nonce and tag")]
    Truncated,
    #[error("authenticated decryption failed")]
    Crypto,
    #[error("padding length prefix exceeds frame body")]
    BadPadding,
    #[error("chunk of {0} bytes exceeds the per-packet maximum")]
    ChunkTooLarge(usize),
}

/// Seals and opens packet payloads for one channel.
///
/// Construct from the shared secret; an empty secret selects unencrypted
/// framing, which is only meant for loopback testing.
pub struct PacketCrypto {
    cipher: Option<Aes256Gcm>,
    padding: Option<PaddingPolicy>,
}

impl PacketCrypto {
    pub fn new(psk: &str, padding: Option<PaddingPolicy>) -> Self {
        let cipher = if psk.is_empty() {
            None
        } else {
            let key = derive_key(psk);
            Some(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
        };

        Self { cipher, padding }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seals one plaintext chunk into a complete wire packet, including the
    /// `u32_be` length prefix.
    pub fn seal(&self, chunk: &[u8]) -> Result<Vec<u8>, FrameError> {
        if chunk.len() > MAX_CHUNK_LEN {
            return Err(FrameError::ChunkTooLarge(chunk.len()));
        }

        let plaintext = match &self.padding {
            Some(policy) => {
                let pad = policy.draw();
                let mut buf = Vec::with_capacity(2 + chunk.len() + pad.len());
                buf.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
                buf.extend_from_slice(chunk);
                buf.extend_from_slice(&pad);
                buf
            }
            None => chunk.to_vec(),
        };

        let payload = match &self.cipher {
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                OsRng.fill_bytes(&mut nonce);

                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
                    .map_err(|_| FrameError::Crypto)?;

                let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                payload.extend_from_slice(&nonce);
                payload.extend_from_slice(&ciphertext);
                payload
            }
            None => plaintext,
        };

        debug_assert!(payload.len() <= MAX_FRAME_LEN);

        let mut packet = Vec::with_capacity(4 + payload.len());
        packet.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        packet.extend_from_slice(&payload);

        Ok(packet)
    }

    /// Opens one packet payload (everything after the length prefix).
    pub fn open(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        let plaintext = match &self.cipher {
            Some(cipher) => {
                if payload.len() < NONCE_LEN + TAG_LEN {
                    return Err(FrameError::Truncated);
                }

                let (nonce, ciphertext) = payload.split_at(NONCE_LEN);

                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| FrameError::Crypto)?
            }
            None => payload.to_vec(),
        };

        match &self.padding {
            Some(_) => {
                if plaintext.len() < 2 {
                    return Err(FrameError::BadPadding);
                }

                let body_len = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
                if body_len > plaintext.len() - 2 {
                    return Err(FrameError::BadPadding);
                }

                Ok(Bytes::copy_from_slice(&plaintext[2..2 + body_len]))
            }
            None => Ok(Bytes::from(plaintext)),
        }
    }
}
