//! AES-128-ECB with PKCS#7 padding, and key derivation from the local key.

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use md5::{Digest, Md5};
use thiserror::Error;

use crate::core::error::FrameError;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Length of a session or local key in bytes.
pub const KEY_LENGTH: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Key must be {KEY_LENGTH} bytes, got {0}")]
pub struct KeyLengthError(pub usize);

/// Symmetric key used to encrypt frame payloads.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LENGTH]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Derives the frame key from a configured local key.
    ///
    /// A 16 byte key is used as-is; anything else is hashed with MD5.
    pub fn from_local_key(local_key: &str) -> Self {
        let raw = local_key.as_bytes();
        match <[u8; KEY_LENGTH]>::try_from(raw) {
            Ok(bytes) => Self(bytes),
            Err(_) => Self(Md5::digest(raw).into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    fn cipher(&self) -> Aes128 {
        Aes128::new(GenericArray::from_slice(&self.0))
    }
}

impl TryFrom<&[u8]> for SessionKey {
    type Error = KeyLengthError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        <[u8; KEY_LENGTH]>::try_from(value)
            .map(Self)
            .map_err(|_| KeyLengthError(value.len()))
    }
}

// Keys never show up in logs.
impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Pads `plain` to a block boundary and encrypts it block by block.
pub fn encrypt(plain: &[u8], key: &SessionKey) -> Vec<u8> {
    let padding = BLOCK_SIZE - plain.len() % BLOCK_SIZE;
    let mut buffer = Vec::with_capacity(plain.len() + padding);
    buffer.extend_from_slice(plain);
    buffer.resize(plain.len() + padding, padding as u8);

    let cipher = key.cipher();
    for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    buffer
}

/// Decrypts `data` and strips the padding, validating every padding byte.
pub fn decrypt(data: &[u8], key: &SessionKey) -> Result<Vec<u8>, FrameError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(FrameError::InvalidPadding);
    }

    let mut buffer = data.to_vec();
    let cipher = key.cipher();
    for block in buffer.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    let padding = usize::from(buffer[buffer.len() - 1]);
    if padding == 0 || padding > BLOCK_SIZE {
        return Err(FrameError::InvalidPadding);
    }
    let body_len = buffer.len() - padding;
    if buffer[body_len..].iter().any(|&b| usize::from(b) != padding) {
        return Err(FrameError::InvalidPadding);
    }
    buffer.truncate(body_len);
    Ok(buffer)
}
