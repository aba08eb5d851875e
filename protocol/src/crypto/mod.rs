//! # Hashing Primitives
//!
//! AuditChain never signs anything itself; the key service does. What it
//! does need is the ledger's own hash construction so that transaction ids
//! computed locally match the ones the network reports.

pub mod hash;

pub use hash::{double_sha256, sha256, txid_bytes_to_hex, txid_hex_to_bytes};
