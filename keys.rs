//! Key material, key wrapping and credential key derivation.
//!
//! This module provides the primitives the key hierarchy is built from:
//!
//! - [`SymmetricKey`]: 256-bit XChaCha20-Poly1305 keys (file content keys,
//!   session keys, credential-derived keys), zeroized on drop
//! - [`KeyPair`]: X25519 user key pairs
//! - [`WrappedKey`]: a key encrypted under another key, either symmetrically
//!   (`iv` + ciphertext + detached `auth_tag`) or sealed to a public key
//!   (ephemeral X25519, HKDF-SHA256, then the same AEAD)
//!
//! ## Security Features
//!
//! - Keys are zeroized on drop (via `Zeroize` trait)
//! - Fresh random 24-byte nonce per wrap via `OsRng`
//! - Credential keys derived with Argon2id (passwords) or HKDF (tokens)

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Key, KeyInit, Tag, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const SALT_LEN: usize = 16;

const SEAL_INFO: &[u8] = b"strongbox/seal/v1";
const TOKEN_INFO: &[u8] = b"strongbox/token/v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key material length: expected {expected}, found {found}")]
    InvalidLength { expected: usize, found: usize },

    /// The AEAD tag did not verify: wrong key, wrong AAD, or tampered bytes.
    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("key wrapping failed")]
    Encryption,

    #[error("key is sealed to a public key; a private key is required")]
    NeedsPrivateKey,

    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// A 256-bit symmetric key.
pub struct SymmetricKey {
    key_bytes: [u8; KEY_LEN],
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl Clone for SymmetricKey {
    fn clone(&self) -> Self {
        Self {
            key_bytes: self.key_bytes,
        }
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key_bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key_bytes);
        Self { key_bytes }
    }

    pub fn from_bytes(key_bytes: [u8; KEY_LEN]) -> Self {
        Self { key_bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let key_bytes: [u8; KEY_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: KEY_LEN,
                found: bytes.len(),
            })?;
        Ok(Self { key_bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key_bytes
    }

    pub fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key_bytes))
    }
}

/// An X25519 key pair belonging to a user.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: KEY_LEN,
            found: bytes.len(),
        })?;
        let secret = StaticSecret::from(raw);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Raw secret bytes, wiped when the returned buffer drops.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Recover a key that was sealed to this pair's public key.
    pub fn open(&self, wrapped: &WrappedKey) -> Result<SymmetricKey, KeyError> {
        let bytes = self.open_bytes(wrapped)?;
        SymmetricKey::from_slice(&bytes)
    }

    pub fn open_bytes(&self, wrapped: &WrappedKey) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let ephemeral = wrapped
            .ephemeral_public
            .as_deref()
            .ok_or(KeyError::TagMismatch)?;
        let ephemeral = public_key_from(ephemeral)?;
        let shared = self.secret.diffie_hellman(&ephemeral);
        let key = derive_seal_key(shared.as_bytes(), ephemeral.as_bytes(), self.public.as_bytes())?;
        decrypt_detached(&key, wrapped, ephemeral.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Key bytes encrypted under another key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "crate::model::b64")]
    pub iv: Vec<u8>,
    #[serde(with = "crate::model::b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::model::b64")]
    pub auth_tag: Vec<u8>,
    /// Present when the key was sealed to an X25519 public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_public: Option<Vec<u8>>,
}

impl WrappedKey {
    pub fn is_sealed(&self) -> bool {
        self.ephemeral_public.is_some()
    }
}

/// Wrap `key` under `wrapping` (symmetric).
pub fn wrap_key(wrapping: &SymmetricKey, key: &SymmetricKey) -> Result<WrappedKey, KeyError> {
    wrap_bytes(wrapping, key.as_bytes(), &[])
}

pub fn unwrap_key(wrapping: &SymmetricKey, wrapped: &WrappedKey) -> Result<SymmetricKey, KeyError> {
    if wrapped.is_sealed() {
        return Err(KeyError::NeedsPrivateKey);
    }
    let bytes = decrypt_detached(wrapping, wrapped, &[])?;
    SymmetricKey::from_slice(&bytes)
}

/// Encrypt arbitrary secret bytes under `wrapping`, binding `aad`.
pub fn wrap_bytes(
    wrapping: &SymmetricKey,
    secret: &[u8],
    aad: &[u8],
) -> Result<WrappedKey, KeyError> {
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);
    let mut buffer = secret.to_vec();
    let tag = wrapping
        .cipher()
        .encrypt_in_place_detached(XNonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|_| KeyError::Encryption)?;
    Ok(WrappedKey {
        iv: iv.to_vec(),
        ciphertext: buffer,
        auth_tag: tag.to_vec(),
        ephemeral_public: None,
    })
}

pub fn unwrap_bytes(
    wrapping: &SymmetricKey,
    wrapped: &WrappedKey,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    decrypt_detached(wrapping, wrapped, aad)
}

/// Seal `key` to an X25519 public key. Only the matching private key opens it.
pub fn seal_key(recipient_public: &[u8], key: &SymmetricKey) -> Result<WrappedKey, KeyError> {
    seal_bytes(recipient_public, key.as_bytes())
}

pub fn seal_bytes(recipient_public: &[u8], secret: &[u8]) -> Result<WrappedKey, KeyError> {
    let recipient = public_key_from(recipient_public)?;
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
    let mut wrapped = wrap_bytes(&key, secret, ephemeral_public.as_bytes())?;
    wrapped.ephemeral_public = Some(ephemeral_public.as_bytes().to_vec());
    Ok(wrapped)
}

fn derive_seal_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> Result<SymmetricKey, KeyError> {
    let mut salt = Vec::with_capacity(ephemeral.len() + recipient.len());
    salt.extend_from_slice(ephemeral);
    salt.extend_from_slice(recipient);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_LEN];
    hkdf.expand(SEAL_INFO, &mut okm)
        .map_err(|e| KeyError::Derivation(e.to_string()))?;
    let key = SymmetricKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

fn public_key_from(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
        expected: KEY_LEN,
        found: bytes.len(),
    })?;
    Ok(PublicKey::from(raw))
}

fn decrypt_detached(
    key: &SymmetricKey,
    wrapped: &WrappedKey,
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, KeyError> {
    if wrapped.iv.len() != NONCE_LEN {
        return Err(KeyError::InvalidLength {
            expected: NONCE_LEN,
            found: wrapped.iv.len(),
        });
    }
    if wrapped.auth_tag.len() != TAG_LEN {
        return Err(KeyError::InvalidLength {
            expected: TAG_LEN,
            found: wrapped.auth_tag.len(),
        });
    }
    let mut buffer = Zeroizing::new(wrapped.ciphertext.clone());
    key.cipher()
        .decrypt_in_place_detached(
            XNonce::from_slice(&wrapped.iv),
            aad,
            &mut buffer,
            Tag::from_slice(&wrapped.auth_tag),
        )
        .map_err(|_| KeyError::TagMismatch)?;
    Ok(buffer)
}

/// Argon2id cost parameters, stored next to every password credential so
/// that changing the defaults never locks out existing users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
        }
    }
}

pub fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn random_token() -> Vec<u8> {
    let mut token = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut token);
    token
}

/// Derive a wrapping key from a password.
pub fn derive_password_key(
    password: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<SymmetricKey, KeyError> {
    let params = Params::new(params.memory_kib, params.iterations, 1, Some(KEY_LEN))
        .map_err(|e| KeyError::Derivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut okm = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut okm)
        .map_err(|e| KeyError::Derivation(e.to_string()))?;
    let key = SymmetricKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Derive a wrapping key from a high-entropy token.
pub fn derive_token_key(token: &[u8], salt: &[u8]) -> Result<SymmetricKey, KeyError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), token);
    let mut okm = [0u8; KEY_LEN];
    hkdf.expand(TOKEN_INFO, &mut okm)
        .map_err(|e| KeyError::Derivation(e.to_string()))?;
    let key = SymmetricKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}
