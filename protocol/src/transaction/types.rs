//! Ledger transaction model and its wire format.
//!
//! The layout is the classic Bitcoin serialization that BSV still uses:
//!
//! ```text
//! version      u32 LE
//! input count  varint
//!   prev txid  32 bytes (wire order)
//!   prev index u32 LE
//!   script     varint length + bytes
//!   sequence   u32 LE
//! output count varint
//!   value      u64 LE
//!   script     varint length + bytes
//! lock_time    u32 LE
//! ```
//!
//! Only what the audit chain needs is modelled: no segwit markers, no
//! script evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::script;
use crate::config;
use crate::crypto::hash::{double_sha256, txid_bytes_to_hex, txid_hex_to_bytes};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures while parsing a raw transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxDecodeError {
    /// The buffer ended before a field was complete.
    #[error("unexpected end of data at offset {offset} (needed {needed} more bytes)")]
    UnexpectedEof {
        /// Offset where the read started.
        offset: usize,
        /// Bytes the field required.
        needed: usize,
    },

    /// Bytes remained after the lock time.
    #[error("{0} trailing bytes after lock_time")]
    TrailingBytes(usize),

    /// A count or length cannot possibly fit in the remaining data.
    #[error("declared {what} of {declared} exceeds remaining {remaining} bytes")]
    ImplausibleLength {
        /// Which field declared the length.
        what: &'static str,
        /// Declared value.
        declared: u64,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Hex input could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// A txid string is not 64 hex digits.
    #[error("invalid txid: {0}")]
    InvalidTxid(String),
}

// ---------------------------------------------------------------------------
// OutPoint
// ---------------------------------------------------------------------------

/// Reference to one output of a previous transaction.
///
/// `txid` is display-order hex, as reported by explorers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// Source transaction id.
    pub txid: String,
    /// Output index inside the source transaction.
    pub index: u32,
}

impl OutPoint {
    /// Creates an outpoint.
    pub fn new(txid: impl Into<String>, index: u32) -> Self {
        Self {
            txid: txid.into(),
            index,
        }
    }

    /// `true` if this points at the reserved root marker.
    pub fn is_root(&self) -> bool {
        self.txid == config::ROOT_MARKER
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

// ---------------------------------------------------------------------------
// Inputs and Outputs
// ---------------------------------------------------------------------------

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// The output being spent.
    pub previous_output: OutPoint,
    /// Unlocking script. Empty until the key service signs.
    pub unlocking_script: Vec<u8>,
    /// Sequence number.
    pub sequence: u32,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// Locking script.
    pub locking_script: Vec<u8>,
}

impl TxOutput {
    /// `true` for a zero-value output whose script starts with the
    /// data-carrier marker.
    pub fn is_data_carrier(&self) -> bool {
        self.value == 0 && script::is_data_carrier(&self.locking_script)
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction format version.
    pub version: u32,
    /// Inputs, in order.
    pub inputs: Vec<TxInput>,
    /// Outputs, in order.
    pub outputs: Vec<TxOutput>,
    /// Lock time.
    pub lock_time: u32,
}

impl Transaction {
    /// Serializes the transaction in wire format.
    ///
    /// Fails only if an input carries a txid that isn't 64 hex digits, which
    /// the builder never produces.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TxDecodeError> {
        let mut buf = Vec::with_capacity(self.estimated_size());

        buf.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            let prev = txid_hex_to_bytes(&input.previous_output.txid)
                .ok_or_else(|| TxDecodeError::InvalidTxid(input.previous_output.txid.clone()))?;
            buf.extend_from_slice(&prev);
            buf.extend_from_slice(&input.previous_output.index.to_le_bytes());
            write_varint(&mut buf, input.unlocking_script.len() as u64);
            buf.extend_from_slice(&input.unlocking_script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut buf, output.locking_script.len() as u64);
            buf.extend_from_slice(&output.locking_script);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        Ok(buf)
    }

    /// Parses a wire-format transaction. The whole buffer must be consumed.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TxDecodeError> {
        let mut r = ByteReader::new(data);

        let version = r.read_u32()?;

        // Each input takes at least 41 bytes, each output at least 9.
        let input_count = r.read_count("input count", 41)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let mut prev = [0u8; 32];
            prev.copy_from_slice(r.take(32)?);
            let index = r.read_u32()?;
            let script_len = r.read_count("unlocking script length", 1)?;
            let unlocking_script = r.take(script_len)?.to_vec();
            let sequence = r.read_u32()?;
            inputs.push(TxInput {
                previous_output: OutPoint::new(txid_bytes_to_hex(&prev), index),
                unlocking_script,
                sequence,
            });
        }

        let output_count = r.read_count("output count", 9)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = r.read_u64()?;
            let script_len = r.read_count("locking script length", 1)?;
            let locking_script = r.take(script_len)?.to_vec();
            outputs.push(TxOutput {
                value,
                locking_script,
            });
        }

        let lock_time = r.read_u32()?;
        if r.remaining() > 0 {
            return Err(TxDecodeError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Parses a hex-encoded raw transaction.
    pub fn from_hex(raw_hex: &str) -> Result<Self, TxDecodeError> {
        let bytes =
            hex::decode(raw_hex.trim()).map_err(|e| TxDecodeError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Hex encoding of [`Transaction::to_bytes`].
    pub fn to_hex(&self) -> Result<String, TxDecodeError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// Display-order txid: reversed double-SHA-256 of the wire bytes.
    pub fn txid(&self) -> Result<String, TxDecodeError> {
        Ok(txid_bytes_to_hex(&double_sha256(&self.to_bytes()?)))
    }

    /// The first data-carrier output and its index, if any.
    pub fn data_carrier(&self) -> Option<(usize, &TxOutput)> {
        self.outputs
            .iter()
            .enumerate()
            .find(|(_, out)| out.is_data_carrier())
    }

    /// The input that continues the chain backward.
    pub fn primary_input(&self) -> Option<&TxInput> {
        self.inputs.first()
    }

    /// Sum of all output values.
    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    fn estimated_size(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|i| 41 + 9 + i.unlocking_script.len())
            .sum();
        let outputs: usize = self
            .outputs
            .iter()
            .map(|o| 8 + 9 + o.locking_script.len())
            .sum();
        4 + 9 + inputs + 9 + outputs + 4
    }
}

/// Txid of a raw wire-format transaction without parsing it.
pub fn txid_of_raw(raw: &[u8]) -> String {
    txid_bytes_to_hex(&double_sha256(raw))
}

// ---------------------------------------------------------------------------
// Varint & cursor helpers
// ---------------------------------------------------------------------------

/// Appends a Bitcoin-style compact size integer.
pub(crate) fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xFC => buf.push(n as u8),
        0xFD..=0xFFFF => {
            buf.push(0xFD);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.push(0xFE);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xFF);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TxDecodeError> {
        if self.remaining() < n {
            return Err(TxDecodeError::UnexpectedEof {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, TxDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, TxDecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, TxDecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, TxDecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_varint(&mut self) -> Result<u64, TxDecodeError> {
        match self.read_u8()? {
            0xFD => Ok(self.read_u16()? as u64),
            0xFE => Ok(self.read_u32()? as u64),
            0xFF => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    /// Reads a varint count and rejects values that cannot fit in what is
    /// left, given the minimum encoded size of each element.
    fn read_count(&mut self, what: &'static str, min_element: usize) -> Result<usize, TxDecodeError> {
        let declared = self.read_varint()?;
        let remaining = self.remaining();
        if declared.saturating_mul(min_element as u64) > remaining as u64 {
            return Err(TxDecodeError::ImplausibleLength {
                what,
                declared,
                remaining,
            });
        }
        Ok(declared as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new("ab".repeat(32), 1),
                unlocking_script: vec![0x51; 20],
                sequence: config::FINAL_SEQUENCE,
            }],
            outputs: vec![
                TxOutput {
                    value: 0,
                    locking_script: script::data_carrier_script(b"{\"metrics\":[]}"),
                },
                TxOutput {
                    value: 9_700,
                    locking_script: vec![0x76, 0xa9, 0x14],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn wire_roundtrip_preserves_all_fields() {
        let tx = sample_tx();
        let bytes = tx.to_bytes().unwrap();
        let parsed = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, tx);
    }

    #[test]
    fn txid_is_reversed_double_sha() {
        let tx = sample_tx();
        let bytes = tx.to_bytes().unwrap();
        let txid = tx.txid().unwrap();
        assert_eq!(txid.len(), 64);
        assert_eq!(txid, txid_of_raw(&bytes));

        let mut digest = double_sha256(&bytes);
        digest.reverse();
        assert_eq!(txid, hex::encode(digest));
    }

    #[test]
    fn known_raw_transaction_parses() {
        // Minimal coinbase-shaped transaction: one root-marker input, one output.
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.push(1);
        raw.extend_from_slice(&[0u8; 32]);
        raw.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        raw.push(0);
        raw.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        raw.push(1);
        raw.extend_from_slice(&5_000u64.to_le_bytes());
        raw.push(1);
        raw.push(0x51);
        raw.extend_from_slice(&0u32.to_le_bytes());

        let tx = Transaction::from_bytes(&raw).unwrap();
        assert!(tx.primary_input().unwrap().previous_output.is_root());
        assert_eq!(tx.outputs[0].value, 5_000);
        assert!(tx.data_carrier().is_none());
    }

    #[test]
    fn truncated_data_is_rejected() {
        let bytes = sample_tx().to_bytes().unwrap();
        let err = Transaction::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, TxDecodeError::UnexpectedEof { .. }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = sample_tx().to_bytes().unwrap();
        bytes.push(0);
        assert_eq!(
            Transaction::from_bytes(&bytes).unwrap_err(),
            TxDecodeError::TrailingBytes(1)
        );
    }

    #[test]
    fn absurd_input_count_is_rejected_without_allocating() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.push(0xFF);
        raw.extend_from_slice(&u64::MAX.to_le_bytes());
        let err = Transaction::from_bytes(&raw).unwrap_err();
        assert!(matches!(err, TxDecodeError::ImplausibleLength { .. }));
    }

    #[test]
    fn varint_boundaries() {
        let cases: [(u64, usize); 5] = [
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0x1_0000_0000, 9),
        ];
        for (n, len) in cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            assert_eq!(buf.len(), len, "varint length for {n:#x}");
            assert_eq!(ByteReader::new(&buf).read_varint().unwrap(), n);
        }
    }

    #[test]
    fn data_carrier_detection_requires_zero_value() {
        let mut tx = sample_tx();
        assert_eq!(tx.data_carrier().map(|(i, _)| i), Some(0));

        tx.outputs[0].value = 1;
        assert!(tx.data_carrier().is_none());
    }

    #[test]
    fn bad_input_txid_fails_serialization() {
        let mut tx = sample_tx();
        tx.inputs[0].previous_output.txid = "nope".to_string();
        assert!(matches!(
            tx.to_bytes().unwrap_err(),
            TxDecodeError::InvalidTxid(_)
        ));
    }

    #[test]
    fn hex_roundtrip() {
        let tx = sample_tx();
        let hex = tx.to_hex().unwrap();
        assert_eq!(Transaction::from_hex(&format!("  {hex}\n")).unwrap(), tx);
        assert!(matches!(
            Transaction::from_hex("xyz").unwrap_err(),
            TxDecodeError::InvalidHex(_)
        ));
    }
}
