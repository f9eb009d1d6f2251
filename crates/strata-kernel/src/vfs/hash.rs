//! Content hashing for fingerprints.

use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Hex-encoded SHA-256 of `data`.
pub fn hash_bytes(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

/// Hex-encoded SHA-256 over a sequence of chunks, as if concatenated.
pub fn hash_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
