//! File content cipher
//!
//! Encrypted files are laid out as
//! `u64 LE original_size ∥ IV ∥ CBC(key, IV, data ∥ ' ' padding)`.
//! [`ContentEncryptor`] and [`ContentDecryptor`] process that format in
//! arbitrary chunks so transfers never hold a whole file in memory.

use std::io::{Read, Write};

use super::{pad_len, random_iv, CbcDecryptor, CbcEncryptor, CryptoError, Key};
use super::{BLOCK_SIZE, PAD_BYTE};

/// Header size of an encrypted file: the size field plus the IV.
pub const MIN_ENC_SIZE: u64 = 8 + BLOCK_SIZE as u64;

const SIZE_FIELD: usize = 8;
const HEADER_LEN: usize = MIN_ENC_SIZE as usize;
const IO_CHUNK: usize = 64 * 1024;

/// Size rounded up to the cipher block, as recorded in filelists.
pub fn padded_size(size: u64) -> u64 {
    size + pad_len((size % BLOCK_SIZE as u64) as usize) as u64
}

/// Size of the ciphertext of a `size`-byte plaintext.
pub fn encrypted_size(size: u64) -> u64 {
    MIN_ENC_SIZE + padded_size(size)
}

/// Padded plaintext size recorded for an encrypted file of `enc_size` bytes.
pub fn padded_size_of_encrypted(enc_size: u64) -> u64 {
    enc_size.saturating_sub(MIN_ENC_SIZE)
}

// ============================================================================
// Encryption
// ============================================================================

/// Streaming encryptor for one file of known size
pub struct ContentEncryptor {
    cipher: CbcEncryptor,
    size: u64,
    consumed: u64,
    pending: Vec<u8>,
    header: Option<Vec<u8>>,
}

impl ContentEncryptor {
    /// Starts encrypting a file of `size` bytes with a random IV.
    pub fn new(key: &Key, size: u64) -> Result<Self, CryptoError> {
        Self::with_iv(key, size, &random_iv())
    }

    pub fn with_iv(key: &Key, size: u64, iv: &[u8]) -> Result<Self, CryptoError> {
        let cipher = CbcEncryptor::new(key, iv)?;
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&size.to_le_bytes());
        header.extend_from_slice(iv);
        Ok(Self {
            cipher,
            size,
            consumed: 0,
            pending: Vec::with_capacity(BLOCK_SIZE),
            header: Some(header),
        })
    }

    /// Total ciphertext length this encryptor will produce.
    pub fn output_size(&self) -> u64 {
        encrypted_size(self.size)
    }

    /// Encrypts a chunk of plaintext, returning the ciphertext ready so far.
    pub fn update(&mut self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.consumed += input.len() as u64;
        if self.consumed > self.size {
            return Err(CryptoError::SizeMismatch {
                expected: self.size,
                actual: self.consumed,
            });
        }

        let mut out = self.header.take().unwrap_or_default();
        self.pending.extend_from_slice(input);
        let aligned = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        if aligned > 0 {
            let mut blocks: Vec<u8> = self.pending.drain(..aligned).collect();
            self.cipher.encrypt_blocks(&mut blocks)?;
            out.extend_from_slice(&blocks);
        }
        Ok(out)
    }

    /// Pads and encrypts the final block.
    pub fn finish(mut self) -> Result<Vec<u8>, CryptoError> {
        if self.consumed != self.size {
            return Err(CryptoError::SizeMismatch {
                expected: self.size,
                actual: self.consumed,
            });
        }
        let mut out = self.header.take().unwrap_or_default();
        if !self.pending.is_empty() {
            let padding = pad_len(self.pending.len());
            self.pending.resize(self.pending.len() + padding, PAD_BYTE);
            self.cipher.encrypt_blocks(&mut self.pending)?;
            out.extend_from_slice(&self.pending);
        }
        Ok(out)
    }
}

// ============================================================================
// Decryption
// ============================================================================

/// Streaming decryptor for one encrypted file
pub struct ContentDecryptor {
    key: Key,
    cipher: Option<CbcDecryptor>,
    header: Vec<u8>,
    size: u64,
    produced: u64,
    received: u64,
    pending: Vec<u8>,
}

impl ContentDecryptor {
    pub fn new(key: &Key) -> Self {
        Self {
            key: key.clone(),
            cipher: None,
            header: Vec::with_capacity(HEADER_LEN),
            size: 0,
            produced: 0,
            received: 0,
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Plaintext size from the header, once it has been read.
    pub fn plain_size(&self) -> Option<u64> {
        self.cipher.as_ref().map(|_| self.size)
    }

    /// Decrypts a chunk of ciphertext, returning the plaintext ready so far.
    pub fn update(&mut self, mut input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.cipher.is_none() {
            let need = HEADER_LEN - self.header.len();
            let take = need.min(input.len());
            self.header.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.header.len() < HEADER_LEN {
                return Ok(Vec::new());
            }
            let mut size_bytes = [0u8; SIZE_FIELD];
            size_bytes.copy_from_slice(&self.header[..SIZE_FIELD]);
            self.size = u64::from_le_bytes(size_bytes);
            self.cipher = Some(CbcDecryptor::new(&self.key, &self.header[SIZE_FIELD..])?);
        }

        self.received += input.len() as u64;
        if self.received > padded_size(self.size) {
            return Err(CryptoError::Decryption(
                "ciphertext longer than its declared size".to_string(),
            ));
        }

        self.pending.extend_from_slice(input);
        let aligned = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        let mut out: Vec<u8> = self.pending.drain(..aligned).collect();
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.decrypt_blocks(&mut out)?;
        }

        let remaining = self.size - self.produced;
        out.truncate(remaining.min(out.len() as u64) as usize);
        self.produced += out.len() as u64;
        Ok(out)
    }

    /// Checks that the whole ciphertext was received.
    pub fn finish(self) -> Result<(), CryptoError> {
        if self.cipher.is_none() {
            return Err(CryptoError::Decryption(format!(
                "truncated header: {} of {} bytes",
                self.header.len(),
                HEADER_LEN
            )));
        }
        if self.received != padded_size(self.size) || !self.pending.is_empty() {
            return Err(CryptoError::Decryption(format!(
                "truncated ciphertext: {} of {} bytes",
                self.received,
                padded_size(self.size)
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Whole-stream helpers
// ============================================================================

/// Encrypts everything `reader` yields into `writer`. Returns bytes written.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &Key,
    size: u64,
    mut reader: R,
    mut writer: W,
) -> std::io::Result<u64> {
    let mut enc = ContentEncryptor::new(key, size).map_err(to_io)?;
    let mut buf = vec![0u8; IO_CHUNK];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let out = enc.update(&buf[..n]).map_err(to_io)?;
        writer.write_all(&out)?;
        written += out.len() as u64;
    }
    let out = enc.finish().map_err(to_io)?;
    writer.write_all(&out)?;
    writer.flush()?;
    Ok(written + out.len() as u64)
}

/// Decrypts everything `reader` yields into `writer`. Returns bytes written.
pub fn decrypt_stream<R: Read, W: Write>(
    key: &Key,
    mut reader: R,
    mut writer: W,
) -> std::io::Result<u64> {
    let mut dec = ContentDecryptor::new(key);
    let mut buf = vec![0u8; IO_CHUNK];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let out = dec.update(&buf[..n]).map_err(to_io)?;
        writer.write_all(&out)?;
        written += out.len() as u64;
    }
    dec.finish().map_err(to_io)?;
    writer.flush()?;
    Ok(written)
}

/// Encrypts an in-memory plaintext.
pub fn encrypt_bytes(key: &Key, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut enc = ContentEncryptor::new(key, data.len() as u64)?;
    let mut out = enc.update(data)?;
    out.extend(enc.finish()?);
    Ok(out)
}

/// Decrypts an in-memory ciphertext.
pub fn decrypt_bytes(key: &Key, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut dec = ContentDecryptor::new(key);
    let out = dec.update(data)?;
    dec.finish()?;
    Ok(out)
}

fn to_io(err: CryptoError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::new(vec![42u8; 32]).unwrap()
    }

    #[test]
    fn sizes() {
        assert_eq!(padded_size(0), 0);
        assert_eq!(padded_size(5), 16);
        assert_eq!(padded_size(16), 16);
        assert_eq!(padded_size(17), 32);
        assert_eq!(encrypted_size(5), 40);
        assert_eq!(padded_size_of_encrypted(encrypted_size(17)), 32);
    }

    #[test]
    fn bytes_round_trip() {
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let enc = encrypt_bytes(&key(), &data).unwrap();
            assert_eq!(enc.len() as u64, encrypted_size(len as u64));
            assert_eq!(&enc[..8], &(len as u64).to_le_bytes());
            assert_eq!(decrypt_bytes(&key(), &enc).unwrap(), data);
        }
    }

    #[test]
    fn chunked_processing_matches_whole() {
        let data: Vec<u8> = (0..333u32).map(|i| i as u8).collect();
        let iv = [9u8; 16];

        let mut whole = ContentEncryptor::with_iv(&key(), 333, &iv).unwrap();
        let mut expected = whole.update(&data).unwrap();
        expected.extend(whole.finish().unwrap());

        let mut chunked = ContentEncryptor::with_iv(&key(), 333, &iv).unwrap();
        let mut actual = Vec::new();
        for piece in data.chunks(7) {
            actual.extend(chunked.update(piece).unwrap());
        }
        actual.extend(chunked.finish().unwrap());
        assert_eq!(expected, actual);

        let mut dec = ContentDecryptor::new(&key());
        let mut plain = Vec::new();
        for piece in actual.chunks(5) {
            plain.extend(dec.update(piece).unwrap());
        }
        assert_eq!(dec.plain_size(), Some(333));
        dec.finish().unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn streams_round_trip() {
        let data = vec![1u8; 200_000];
        let mut enc = Vec::new();
        let written = encrypt_stream(&key(), data.len() as u64, &data[..], &mut enc).unwrap();
        assert_eq!(written, encrypted_size(200_000));

        let mut plain = Vec::new();
        decrypt_stream(&key(), &enc[..], &mut plain).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn size_mismatch_and_truncation_are_errors() {
        let mut enc = ContentEncryptor::new(&key(), 3).unwrap();
        assert!(enc.update(b"four").is_err());

        let enc = ContentEncryptor::new(&key(), 3).unwrap();
        assert!(enc.finish().is_err());

        let ct = encrypt_bytes(&key(), b"hello world").unwrap();
        assert!(decrypt_bytes(&key(), &ct[..ct.len() - 1]).is_err());
        assert!(decrypt_bytes(&key(), &ct[..10]).is_err());
    }
}
