//! Filename and path ciphers
//!
//! One encrypted segment is `encode(pad_len ∥ IV ∥ CBC(key, IV, name ∥ ' ' × pad_len))`
//! where `pad_len = (16 - len % 16) % 16`. The IV travels inside the name, so
//! decrypting a storage name recovers both the plaintext and the IV that
//! produced it. Storing those IVs in the filelist makes re-encryption of an
//! observed path deterministic.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;

use super::{base41, decrypt_block, encrypt_block, pad_len, random_iv, CryptoError, Key};
use super::{BLOCK_SIZE, PAD_BYTE};
use crate::domain::folder::FilenameEncoding;
use crate::domain::path::SEP;

/// IV reported for the unencrypted `.` and `..` segments.
pub const DUMMY_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Header bytes in front of a segment's ciphertext.
const HEADER_LEN: usize = 1 + BLOCK_SIZE;

fn is_special(name: &str) -> bool {
    name == "." || name == ".."
}

/// Encodes ciphertext bytes with the folder's alphabet.
pub fn encode(data: &[u8], encoding: FilenameEncoding) -> String {
    match encoding {
        FilenameEncoding::Base64 => URL_SAFE.encode(data),
        FilenameEncoding::Base41 => base41::encode(data),
    }
}

/// Decodes a storage name with the folder's alphabet.
pub fn decode(text: &str, encoding: FilenameEncoding) -> Result<Vec<u8>, CryptoError> {
    match encoding {
        FilenameEncoding::Base64 => URL_SAFE
            .decode(text)
            .map_err(|e| CryptoError::Encoding(e.to_string())),
        FilenameEncoding::Base41 => base41::decode(text),
    }
}

/// Encrypts one path segment with `iv`.
///
/// Returns the encoded name and the IV actually used: [`DUMMY_IV`] for `.`
/// and `..`, nothing for the empty name.
pub fn encrypt_filename(
    name: &str,
    key: &Key,
    iv: &[u8],
    encoding: FilenameEncoding,
) -> Result<(String, Vec<u8>), CryptoError> {
    if name.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    if is_special(name) {
        return Ok((name.to_string(), DUMMY_IV.to_vec()));
    }
    if iv.len() != BLOCK_SIZE {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }

    let padding = pad_len(name.len());
    let mut plaintext = Vec::with_capacity(name.len() + padding);
    plaintext.extend_from_slice(name.as_bytes());
    plaintext.resize(name.len() + padding, PAD_BYTE);

    let ciphertext = encrypt_block(key, iv, &plaintext)?;

    let mut raw = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    raw.push(padding as u8);
    raw.extend_from_slice(iv);
    raw.extend_from_slice(&ciphertext);

    Ok((encode(&raw, encoding), iv.to_vec()))
}

/// Decrypts one storage name back into `(name, iv)`.
pub fn decrypt_filename(
    encrypted: &str,
    key: &Key,
    encoding: FilenameEncoding,
) -> Result<(String, Vec<u8>), CryptoError> {
    if encrypted.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    if is_special(encrypted) {
        return Ok((encrypted.to_string(), DUMMY_IV.to_vec()));
    }

    let raw = decode(encrypted, encoding)?;
    if raw.len() < HEADER_LEN + BLOCK_SIZE || (raw.len() - HEADER_LEN) % BLOCK_SIZE != 0 {
        return Err(CryptoError::Decryption(format!(
            "encrypted name has invalid length {}",
            raw.len()
        )));
    }

    let padding = raw[0] as usize;
    if padding >= BLOCK_SIZE {
        return Err(CryptoError::Decryption(format!(
            "invalid padding length {padding}"
        )));
    }

    let iv = &raw[1..HEADER_LEN];
    let mut plaintext = decrypt_block(key, iv, &raw[HEADER_LEN..])?;
    plaintext.truncate(plaintext.len() - padding);

    let name = String::from_utf8(plaintext)
        .map_err(|_| CryptoError::Decryption("name is not valid UTF-8".to_string()))?;
    Ok((name, iv.to_vec()))
}

/// Encrypts every non-empty segment of `path`.
///
/// Segment `k` uses `ivs[16k..16k + 16]` when available; segments beyond the
/// supplied IVs get fresh random ones. Separators (including leading and
/// trailing ones) are preserved. Returns the encrypted path and the IVs used,
/// left to right.
pub fn encrypt_path(
    path: &str,
    key: &Key,
    ivs: Option<&[u8]>,
    encoding: FilenameEncoding,
) -> Result<(String, Vec<u8>), CryptoError> {
    let ivs = ivs.unwrap_or_default();
    if ivs.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidIvLength(ivs.len()));
    }
    let mut supplied = ivs.chunks_exact(BLOCK_SIZE);

    let mut out_segments = Vec::new();
    let mut used = Vec::with_capacity(ivs.len());

    for segment in path.split(SEP) {
        if segment.is_empty() {
            out_segments.push(String::new());
            continue;
        }
        let fresh;
        let iv = match supplied.next() {
            Some(iv) => iv,
            None => {
                fresh = random_iv();
                &fresh[..]
            }
        };
        let (enc, iv_used) = encrypt_filename(segment, key, iv, encoding)?;
        out_segments.push(enc);
        used.extend_from_slice(&iv_used);
    }

    if supplied.next().is_some() {
        return Err(CryptoError::InvalidIvLength(ivs.len()));
    }

    Ok((out_segments.join(&SEP.to_string()), used))
}

/// Decrypts every non-empty segment of an encrypted path.
pub fn decrypt_path(
    path: &str,
    key: &Key,
    encoding: FilenameEncoding,
) -> Result<(String, Vec<u8>), CryptoError> {
    let mut out_segments = Vec::new();
    let mut ivs = Vec::new();

    for segment in path.split(SEP) {
        if segment.is_empty() {
            out_segments.push(String::new());
            continue;
        }
        let (name, iv) = decrypt_filename(segment, key, encoding)?;
        out_segments.push(name);
        ivs.extend_from_slice(&iv);
    }

    Ok((out_segments.join(&SEP.to_string()), ivs))
}
