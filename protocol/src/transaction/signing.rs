//! Signing hand-off.
//!
//! AuditChain never touches private keys. The writer packages everything a
//! key service needs to compute the sighash and unlock the head output into
//! a [`SigningContext`], and attaches whatever [`UnlockingProof`] comes back.
//! Signing is separate from building for the same reason as in any wallet:
//! the key may live in a hardware device or a remote signer.

use serde::{Deserialize, Serialize};

use super::types::{Transaction, TxOutput};
use crate::error::{AuditError, AuditResult};

/// Everything needed to unlock one input of an unsigned transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    /// Address whose key must sign.
    pub address: String,
    /// The unsigned transaction.
    pub transaction: Transaction,
    /// Index of the input to unlock.
    pub input_index: usize,
    /// The output being spent (value and locking script feed the sighash).
    pub source_output: TxOutput,
}

/// Hex-encoded form of a [`SigningContext`], suitable for handing to an
/// external signer process or service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    /// Address whose key must sign.
    pub address: String,
    /// Unsigned raw transaction, hex.
    pub unsigned_tx_hex: String,
    /// Input to unlock.
    pub input_index: usize,
    /// Source txid of that input.
    pub source_txid: String,
    /// Source output index of that input.
    pub source_output_index: u32,
    /// Value of the output being spent.
    pub source_value: u64,
    /// Locking script of the output being spent, hex.
    pub source_locking_script_hex: String,
}

impl SigningContext {
    /// Builds the hex request form.
    pub fn to_request(&self) -> AuditResult<SignRequest> {
        let input = self
            .transaction
            .inputs
            .get(self.input_index)
            .ok_or_else(|| AuditError::Signing(format!("no input at index {}", self.input_index)))?;
        Ok(SignRequest {
            address: self.address.clone(),
            unsigned_tx_hex: self.transaction.to_hex()?,
            input_index: self.input_index,
            source_txid: input.previous_output.txid.clone(),
            source_output_index: input.previous_output.index,
            source_value: self.source_output.value,
            source_locking_script_hex: hex::encode(&self.source_output.locking_script),
        })
    }
}

/// The unlocking script produced by a key service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockingProof(pub Vec<u8>);

impl UnlockingProof {
    /// Parses a hex-encoded unlocking script.
    pub fn from_hex(s: &str) -> AuditResult<Self> {
        hex::decode(s.trim())
            .map(Self)
            .map_err(|e| AuditError::Signing(format!("unlocking script is not hex: {e}")))
    }

    /// Raw script bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Attaches a proof to input `input_index`, returning the signed transaction.
///
/// An empty proof is refused: broadcasting it could only fail, and it would
/// hide a broken key service behind a network error.
pub fn apply_unlocking_proof(
    mut tx: Transaction,
    input_index: usize,
    proof: UnlockingProof,
) -> AuditResult<Transaction> {
    if proof.0.is_empty() {
        return Err(AuditError::Signing("key service returned an empty proof".to_string()));
    }
    let input = tx
        .inputs
        .get_mut(input_index)
        .ok_or_else(|| AuditError::Signing(format!("no input at index {input_index}")))?;
    input.unlocking_script = proof.0;
    Ok(tx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
