//! Byte codec, hashing, transaction and merkle primitives.

pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

/// 32-byte hash in little-endian wire order.
pub type Hash256 = [u8; 32];

/// Render a hash the way block explorers print it (byte-reversed hex).
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn hash_from_hex(hex: &str) -> Option<Hash256> {
    let bytes = hex.as_bytes();
    if bytes.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[31 - i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}
