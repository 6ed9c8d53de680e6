//! Base41 filename encoding
//!
//! An alphabet that survives case-folding storages: every pair of input bytes
//! becomes three characters (41³ > 2¹⁶) and a trailing single byte becomes two.
//! Digits are most significant first, so encoded strings keep the byte order
//! of their inputs. Decoding accepts uppercase letters.

use super::CryptoError;

/// The 41 characters, in digit order.
pub const ALPHABET: &[u8; 41] = b"!+-0123456789=_abcdefghijklmnopqrstuvwxyz";

const BASE: u32 = 41;

fn digit(c: u8) -> Option<u32> {
    let c = c.to_ascii_lowercase();
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u32)
}

/// Encodes bytes into base41 text.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() / 2 * 3 + 2);
    let mut pairs = data.chunks_exact(2);

    for pair in &mut pairs {
        let v = (u32::from(pair[0]) << 8) | u32::from(pair[1]);
        out.push(ALPHABET[(v / (BASE * BASE)) as usize] as char);
        out.push(ALPHABET[(v / BASE % BASE) as usize] as char);
        out.push(ALPHABET[(v % BASE) as usize] as char);
    }
    if let [last] = pairs.remainder() {
        let v = u32::from(*last);
        out.push(ALPHABET[(v / BASE) as usize] as char);
        out.push(ALPHABET[(v % BASE) as usize] as char);
    }
    out
}

/// Decodes base41 text.
pub fn decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = text.as_bytes();
    if bytes.len() % 3 == 1 {
        return Err(CryptoError::Encoding(format!(
            "base41 text of length {} is truncated",
            bytes.len()
        )));
    }

    let digits = bytes
        .iter()
        .map(|&c| {
            digit(c).ok_or_else(|| {
                CryptoError::Encoding(format!("invalid base41 character {:?}", c as char))
            })
        })
        .collect::<Result<Vec<u32>, _>>()?;

    let mut out = Vec::with_capacity(digits.len() / 3 * 2 + 1);
    let mut triples = digits.chunks_exact(3);
    for t in &mut triples {
        let v = t[0] * BASE * BASE + t[1] * BASE + t[2];
        if v > 0xFFFF {
            return Err(CryptoError::Encoding(format!("base41 group overflows: {v}")));
        }
        out.push((v >> 8) as u8);
        out.push((v & 0xFF) as u8);
    }
    if let [hi, lo] = triples.remainder() {
        let v = hi * BASE + lo;
        if v > 0xFF {
            return Err(CryptoError::Encoding(format!("base41 tail overflows: {v}")));
        }
        out.push(v as u8);
    }
    Ok(out)
}
