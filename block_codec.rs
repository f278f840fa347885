//! Per-block encryption for file content.
//!
//! This module provides [`BlockCodec`] for sealing the fixed-size blocks that
//! make up a snapshot's bytes. Each block is encrypted independently with the
//! file's content key, so random-access reads and writes touch only the
//! blocks they cover.
//!
//! ## Block Format
//!
//! ```text
//! [version:1][flags:1][nonce:24][encrypted_data + tag:16]
//! ```
//!
//! The AEAD associated data binds `(file, content, index)`, so a block cannot
//! be swapped into another position or another file without failing
//! authentication. The snapshot id is deliberately not bound: forking a
//! snapshot copies ciphertext verbatim.
//!
//! ## Block Size
//!
//! Blocks hold 256 KiB of plaintext. Blocks that compress well (sparse or
//! zero-extended regions) are deflated before encryption.

use chacha20poly1305::aead::{Aead, AeadCore, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rand_core::OsRng;
use std::io::{Read, Write};
use thiserror::Error;

use crate::keys::{SymmetricKey, NONCE_LEN};
use crate::model::{ContentId, FileId};

/// Plaintext bytes per block (256 KiB)
pub const BLOCK_SIZE: usize = 256 * 1024;

/// Block format version
pub const VERSION_V1_BLOCK: u8 = 1;

const HEADER_LEN: usize = 2 + NONCE_LEN;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("unsupported block format version: {0}")]
    Version(u8),

    #[error("block truncated: {0} bytes")]
    Truncated(usize),

    #[error("block failed authentication")]
    Authentication,

    #[error("block encryption failed")]
    Encryption,

    #[error("block compression failed: {0}")]
    Compression(String),

    #[error("block holds {0} bytes, more than one block")]
    Oversized(usize),
}

/// Flags for block format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatFlags {
    pub compressed: bool,
}

impl FormatFlags {
    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.compressed {
            flags |= 0x01; // Bit 0: deflate before encryption
        }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            compressed: (byte & 0x01) != 0,
        }
    }
}

/// Position of a block inside a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddress {
    pub file_id: FileId,
    pub content_id: ContentId,
    pub index: u64,
}

impl BlockAddress {
    fn aad(&self) -> [u8; 24] {
        let mut aad = [0u8; 24];
        aad[..8].copy_from_slice(&self.file_id.to_le_bytes());
        aad[8..16].copy_from_slice(&self.content_id.to_le_bytes());
        aad[16..].copy_from_slice(&self.index.to_le_bytes());
        aad
    }
}

/// BlockCodec seals and opens individual content blocks.
#[derive(Debug, Clone, Copy)]
pub struct BlockCodec {
    compress: bool,
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self { compress: true }
    }
}

impl BlockCodec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    /// Encrypts one block of plaintext.
    pub fn seal(
        &self,
        key: &SymmetricKey,
        address: &BlockAddress,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, BlockError> {
        if plaintext.len() > BLOCK_SIZE {
            return Err(BlockError::Oversized(plaintext.len()));
        }

        let deflated = if self.compress {
            let packed = deflate(plaintext)?;
            (packed.len() < plaintext.len()).then_some(packed)
        } else {
            None
        };
        let flags = FormatFlags {
            compressed: deflated.is_some(),
        };
        let body = deflated.as_deref().unwrap_or(plaintext);

        let cipher: XChaCha20Poly1305 = key.cipher();
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = address.aad();
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: body, aad: &aad })
            .map_err(|_| BlockError::Encryption)?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.push(VERSION_V1_BLOCK);
        out.push(flags.to_byte());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts one block, returning its plaintext.
    pub fn open(
        &self,
        key: &SymmetricKey,
        address: &BlockAddress,
        sealed: &[u8],
    ) -> Result<Vec<u8>, BlockError> {
        if sealed.len() < HEADER_LEN {
            return Err(BlockError::Truncated(sealed.len()));
        }
        if sealed[0] != VERSION_V1_BLOCK {
            return Err(BlockError::Version(sealed[0]));
        }
        let flags = FormatFlags::from_byte(sealed[1]);
        let nonce = XNonce::from_slice(&sealed[2..HEADER_LEN]);
        let aad = address.aad();

        let body = key
            .cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[HEADER_LEN..],
                    aad: &aad,
                },
            )
            .map_err(|_| BlockError::Authentication)?;

        if flags.compressed {
            inflate(&body)
        } else {
            Ok(body)
        }
    }
}

fn deflate(plaintext: &[u8]) -> Result<Vec<u8>, BlockError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(plaintext)
        .map_err(|e| BlockError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| BlockError::Compression(e.to_string()))
}

fn inflate(body: &[u8]) -> Result<Vec<u8>, BlockError> {
    let mut out = Vec::new();
    DeflateDecoder::new(body)
        .take(BLOCK_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| BlockError::Compression(e.to_string()))?;
    if out.len() > BLOCK_SIZE {
        return Err(BlockError::Oversized(out.len()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(index: u64) -> BlockAddress {
        BlockAddress {
            file_id: 3,
            content_id: 9,
            index,
        }
    }

    #[test]
    fn full_block_survives_sealing() {
        let key = SymmetricKey::generate();
        let codec = BlockCodec::default();
        let plaintext: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 7 % 251) as u8).collect();

        let sealed = codec.seal(&key, &address(0), &plaintext).expect("seal");
        assert_eq!(sealed[0], VERSION_V1_BLOCK);

        let opened = codec.open(&key, &address(0), &sealed).expect("open");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn zero_filled_blocks_are_compressed() {
        let key = SymmetricKey::generate();
        let codec = BlockCodec::default();
        let zeros = vec![0u8; BLOCK_SIZE];

        let sealed = codec.seal(&key, &address(1), &zeros).expect("seal");
        assert!(FormatFlags::from_byte(sealed[1]).compressed);
        assert!(sealed.len() < BLOCK_SIZE / 10);
        assert_eq!(codec.open(&key, &address(1), &sealed).expect("open"), zeros);
    }

    #[test]
    fn compression_can_be_disabled() {
        let key = SymmetricKey::generate();
        let codec = BlockCodec::new(false);
        let sealed = codec.seal(&key, &address(1), &[0u8; 4096]).expect("seal");
        assert!(!FormatFlags::from_byte(sealed[1]).compressed);
    }

    #[test]
    fn moved_block_fails_authentication() {
        let key = SymmetricKey::generate();
        let codec = BlockCodec::default();
        let sealed = codec.seal(&key, &address(2), b"block two").expect("seal");

        let result = codec.open(&key, &address(3), &sealed);
        assert!(matches!(result, Err(BlockError::Authentication)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let codec = BlockCodec::default();
        let sealed = codec
            .seal(&SymmetricKey::generate(), &address(0), b"secret")
            .expect("seal");
        let result = codec.open(&SymmetricKey::generate(), &address(0), &sealed);
        assert!(matches!(result, Err(BlockError::Authentication)));
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let codec = BlockCodec::default();
        let result = codec.seal(&SymmetricKey::generate(), &address(0), &vec![1u8; BLOCK_SIZE + 1]);
        assert!(matches!(result, Err(BlockError::Oversized(_))));
    }

    #[test]
    fn flags_round_trip() {
        let flags = FormatFlags { compressed: true };
        assert!(FormatFlags::from_byte(flags.to_byte()).compressed);

        let flags = FormatFlags { compressed: false };
        assert!(!FormatFlags::from_byte(flags.to_byte()).compressed);
    }

    #[test]
    fn garbage_header_is_rejected() {
        let codec = BlockCodec::default();
        let key = SymmetricKey::generate();
        assert!(matches!(
            codec.open(&key, &address(0), &[1, 0, 3]),
            Err(BlockError::Truncated(3))
        ));
        let mut bogus = vec![0u8; HEADER_LEN + 16];
        bogus[0] = 9;
        assert!(matches!(
            codec.open(&key, &address(0), &bogus),
            Err(BlockError::Version(9))
        ));
    }
}
