//! # Hashing Utilities
//!
//! SHA-256 and the double-SHA-256 transaction id construction used by
//! Bitcoin-family ledgers.
//!
//! ## Byte order
//!
//! Transaction ids are displayed big-endian (the way explorers and APIs
//! print them) but serialized little-endian inside inputs. The two helpers
//! at the bottom of this file are the only place that flip between the two;
//! everything else passes hex strings around in display order.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of the input data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// `SHA-256(SHA-256(data))`, the ledger's transaction hash.
///
/// # Example
///
/// ```
/// use auditchain_protocol::crypto::double_sha256;
///
/// let hash = double_sha256(b"audit");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Convert a wire-order (little-endian) txid into display hex.
pub fn txid_bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut reversed = *bytes;
    reversed.reverse();
    hex::encode(reversed)
}

/// Convert a display-hex txid into wire order. Returns `None` unless the
/// input is exactly 64 hex digits.
pub fn txid_hex_to_bytes(txid: &str) -> Option<[u8; 32]> {
    if txid.len() != 64 {
        return None;
    }
    let decoded = hex::decode(txid).ok()?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&decoded);
    out.reverse();
    Some(out)
}
