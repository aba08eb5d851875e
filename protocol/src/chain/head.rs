//! Chain heads and head selection.
//!
//! The head is the single unspent output that the next link must spend.
//! When the local cache has nothing for an address, the writer asks the UTXO
//! service and picks one with [`select_head`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::transaction::OutPoint;

/// The one spendable output that extends the chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHead {
    /// Transaction holding the output.
    pub txid: String,
    /// Output index.
    pub output_index: u32,
    /// Value in satoshis.
    pub value: u64,
}

impl ChainHead {
    /// Creates a head.
    pub fn new(txid: impl Into<String>, output_index: u32, value: u64) -> Self {
        Self {
            txid: txid.into(),
            output_index,
            value,
        }
    }

    /// The outpoint this head refers to.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.output_index)
    }
}

impl fmt::Display for ChainHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({} sats)", self.txid, self.output_index, self.value)
    }
}

/// An unspent output as reported by the UTXO service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Transaction holding the output.
    pub txid: String,
    /// Output index.
    pub output_index: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Block height of confirmation, `0` while unconfirmed.
    pub height: u64,
}

impl From<&Utxo> for ChainHead {
    fn from(u: &Utxo) -> Self {
        ChainHead::new(u.txid.clone(), u.output_index, u.value)
    }
}

/// Picks the head among an address's unspent outputs.
///
/// Greatest confirmation height wins, ties go to the greatest value. Any
/// remaining tie is settled by the lowest `(txid, output_index)` so that the
/// answer never depends on the order the service listed the outputs in.
pub fn select_head(utxos: &[Utxo]) -> Option<ChainHead> {
    utxos
        .iter()
        .max_by(|a, b| {
            a.height
                .cmp(&b.height)
                .then_with(|| a.value.cmp(&b.value))
                .then_with(|| order_by_outpoint_desc(a, b))
        })
        .map(ChainHead::from)
}

/// Reverse outpoint order so `max_by` prefers the lowest outpoint.
fn order_by_outpoint_desc(a: &Utxo, b: &Utxo) -> Ordering {
    (&b.txid, b.output_index).cmp(&(&a.txid, a.output_index))
}
