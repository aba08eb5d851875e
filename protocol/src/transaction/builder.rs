//! Chain link construction via the builder pattern.
//!
//! The [`ChainLinkBuilder`] turns a chain head and an encoded payload into an
//! unsigned one-in/two-out transaction:
//!
//! ```text
//! input 0   spends the head
//! output 0  value 0, OP_RETURN <payload>
//! output 1  head.value - fee, back to the logging address
//! ```
//!
//! The builder does not sign; that happens through the key service in
//! [`super::signing`]. Fee and dust arithmetic lives here so it can be
//! tested without any collaborator.

use super::script::data_carrier_script;
use super::types::{Transaction, TxInput, TxOutput};
use crate::chain::head::ChainHead;
use crate::config;
use crate::error::{AuditError, AuditResult};

/// An unsigned chain link plus the head it will create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedLink {
    /// The transaction, with an empty unlocking script on input 0.
    pub transaction: Transaction,
    /// Value of the change output.
    pub change_value: u64,
}

/// Fluent builder for chain link transactions.
///
/// # Usage
///
/// ```rust
/// use auditchain_protocol::chain::ChainHead;
/// use auditchain_protocol::transaction::ChainLinkBuilder;
///
/// let head = ChainHead::new("ab".repeat(32), 1, 10_000);
/// let link = ChainLinkBuilder::new(head)
///     .payload(br#"{"metrics":[]}"#.to_vec())
///     .change_script(vec![0x76, 0xa9])
///     .build()
///     .unwrap();
/// assert_eq!(link.change_value, 10_000 - 300);
/// ```
pub struct ChainLinkBuilder {
    head: ChainHead,
    payload: Vec<u8>,
    change_script: Vec<u8>,
    fee: u64,
    dust_threshold: u64,
}

impl ChainLinkBuilder {
    /// Starts a link spending `head`, with the default fee and dust limit.
    pub fn new(head: ChainHead) -> Self {
        Self {
            head,
            payload: Vec::new(),
            change_script: Vec::new(),
            fee: config::DEFAULT_FEE_SATS,
            dust_threshold: config::DUST_THRESHOLD_SATS,
        }
    }

    /// Sets the encoded batch carried by output 0.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the locking script of the change output.
    pub fn change_script(mut self, script: Vec<u8>) -> Self {
        self.change_script = script;
        self
    }

    /// Overrides the flat fee.
    pub fn fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    /// Overrides the dust threshold.
    pub fn dust_threshold(mut self, dust: u64) -> Self {
        self.dust_threshold = dust;
        self
    }

    /// Consumes the builder and produces the unsigned link.
    ///
    /// Fails with [`AuditError::InsufficientFunds`] when the change would be
    /// at or below the dust threshold. Never produces a negative or dust
    /// output.
    pub fn build(self) -> AuditResult<UnsignedLink> {
        let required = self.fee.saturating_add(self.dust_threshold);
        if self.head.value <= required {
            return Err(AuditError::InsufficientFunds {
                value: self.head.value,
                required,
            });
        }
        let change_value = self.head.value - self.fee;

        let transaction = Transaction {
            version: config::CHAIN_TX_VERSION,
            inputs: vec![TxInput {
                previous_output: self.head.outpoint(),
                unlocking_script: Vec::new(),
                sequence: config::FINAL_SEQUENCE,
            }],
            outputs: vec![
                TxOutput {
                    value: 0,
                    locking_script: data_carrier_script(&self.payload),
                },
                TxOutput {
                    value: change_value,
                    locking_script: self.change_script,
                },
            ],
            lock_time: 0,
        };

        Ok(UnsignedLink {
            transaction,
            change_value,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
