//! Cryptography for encrypted folders
//!
//! - [`filename`] - per-segment filename cipher and the path cipher built on it
//! - [`base41`] - case-insensitive filename alphabet
//! - [`content`] - file ciphertext format (`size ∥ IV ∥ CBC(data)`)
//!
//! All ciphers are AES in CBC mode with space (`0x20`) padding. Keys may be
//! 16, 24 or 32 bytes long and select AES-128/192/256 respectively.

pub mod base41;
pub mod content;
pub mod filename;

use std::fmt;

use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

pub use content::{encrypted_size, padded_size, padded_size_of_encrypted, MIN_ENC_SIZE};
pub use filename::{decrypt_filename, decrypt_path, encrypt_filename, encrypt_path, DUMMY_IV};

/// Cipher block size, which is also the IV size.
pub const BLOCK_SIZE: usize = 16;

/// Byte used to pad plaintexts to the block size.
pub const PAD_BYTE: u8 = b' ';

/// Errors raised by the ciphers and encoders
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key is not 16, 24 or 32 bytes long
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// IV is not 16 bytes long, or an IV list is not a multiple of 16
    #[error("Invalid IV length: {0} bytes")]
    InvalidIvLength(usize),

    /// Cipher input is not a whole number of blocks
    #[error("Data of {0} bytes is not block aligned")]
    Unaligned(usize),

    /// Plaintext length differs from the size declared up front
    #[error("Plaintext size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Ciphertext could not be decrypted
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Encoded text is not valid for the selected alphabet
    #[error("Invalid encoding: {0}")]
    Encoding(String),
}

/// A symmetric key
///
/// The bytes never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Key(Vec<u8>);

impl Key {
    /// Wraps raw key bytes, checking the length.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let bytes = bytes.into();
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            n => Err(CryptoError::InvalidKeyLength(n)),
        }
    }

    /// Parses a URL-safe base64 key as stored in the configuration.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Self::new(bytes)
    }

    /// Generates a fresh random key of `len` bytes.
    pub fn generate(len: usize) -> Result<Self, CryptoError> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(<{} bytes>)", self.0.len())
    }
}

/// Returns a fresh random IV.
pub fn random_iv() -> [u8; BLOCK_SIZE] {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Checks and copies a 16-byte IV out of a slice.
pub fn iv_from_slice(iv: &[u8]) -> Result<[u8; BLOCK_SIZE], CryptoError> {
    iv.try_into()
        .map_err(|_| CryptoError::InvalidIvLength(iv.len()))
}

/// Number of padding bytes needed to reach a block boundary.
pub fn pad_len(len: usize) -> usize {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

// ============================================================================
// CBC state machines
// ============================================================================

enum EncryptorInner {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

/// Stateful CBC encryptor; successive calls continue the chain.
pub struct CbcEncryptor(EncryptorInner);

impl CbcEncryptor {
    pub fn new(key: &Key, iv: &[u8]) -> Result<Self, CryptoError> {
        if iv.len() != BLOCK_SIZE {
            return Err(CryptoError::InvalidIvLength(iv.len()));
        }
        let k = key.as_bytes();
        let bad_key = |_| CryptoError::InvalidKeyLength(k.len());
        let inner = match k.len() {
            16 => EncryptorInner::Aes128(cbc::Encryptor::new_from_slices(k, iv).map_err(bad_key)?),
            24 => EncryptorInner::Aes192(cbc::Encryptor::new_from_slices(k, iv).map_err(bad_key)?),
            32 => EncryptorInner::Aes256(cbc::Encryptor::new_from_slices(k, iv).map_err(bad_key)?),
            n => return Err(CryptoError::InvalidKeyLength(n)),
        };
        Ok(Self(inner))
    }

    /// Encrypts whole blocks in place.
    pub fn encrypt_blocks(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Unaligned(data.len()));
        }
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(chunk);
            match &mut self.0 {
                EncryptorInner::Aes128(c) => c.encrypt_block_mut(block),
                EncryptorInner::Aes192(c) => c.encrypt_block_mut(block),
                EncryptorInner::Aes256(c) => c.encrypt_block_mut(block),
            }
        }
        Ok(())
    }
}

enum DecryptorInner {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

/// Stateful CBC decryptor; successive calls continue the chain.
pub struct CbcDecryptor(DecryptorInner);

impl CbcDecryptor {
    pub fn new(key: &Key, iv: &[u8]) -> Result<Self, CryptoError> {
        if iv.len() != BLOCK_SIZE {
            return Err(CryptoError::InvalidIvLength(iv.len()));
        }
        let k = key.as_bytes();
        let bad_key = |_| CryptoError::InvalidKeyLength(k.len());
        let inner = match k.len() {
            16 => DecryptorInner::Aes128(cbc::Decryptor::new_from_slices(k, iv).map_err(bad_key)?),
            24 => DecryptorInner::Aes192(cbc::Decryptor::new_from_slices(k, iv).map_err(bad_key)?),
            32 => DecryptorInner::Aes256(cbc::Decryptor::new_from_slices(k, iv).map_err(bad_key)?),
            n => return Err(CryptoError::InvalidKeyLength(n)),
        };
        Ok(Self(inner))
    }

    /// Decrypts whole blocks in place.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Unaligned(data.len()));
        }
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(chunk);
            match &mut self.0 {
                DecryptorInner::Aes128(c) => c.decrypt_block_mut(block),
                DecryptorInner::Aes192(c) => c.decrypt_block_mut(block),
                DecryptorInner::Aes256(c) => c.decrypt_block_mut(block),
            }
        }
        Ok(())
    }
}

/// Encrypts a block-aligned plaintext in one go.
pub fn encrypt_block(key: &Key, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = plaintext.to_vec();
    CbcEncryptor::new(key, iv)?.encrypt_blocks(&mut out)?;
    Ok(out)
}

/// Decrypts a block-aligned ciphertext in one go.
pub fn decrypt_block(key: &Key, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = ciphertext.to_vec();
    CbcDecryptor::new(key, iv)?.decrypt_blocks(&mut out)?;
    Ok(out)
}
