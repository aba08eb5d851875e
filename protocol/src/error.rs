//! Error types for AuditChain.
//!
//! Every write or read path returns an [`AuditError`]. The first group of
//! variants aborts a flush and leaves the batch buffer untouched; the caller
//! decides when to retry. `ChainIntegrity` aborts a history read.

use thiserror::Error;

use crate::storage::cache::DbError;
use crate::storage::staging::StagingError;
use crate::transaction::TxDecodeError;

/// Which network step a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    /// Listing unspent outputs for the address.
    UtxoQuery,
    /// Fetching a raw transaction.
    TxFetch,
    /// Submitting the signed transaction.
    Broadcast,
}

impl std::fmt::Display for NetworkStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UtxoQuery => write!(f, "utxo query"),
            Self::TxFetch => write!(f, "transaction fetch"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Errors raised by the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The chain head cannot cover the fee and still leave a non-dust change.
    #[error("insufficient funds: head holds {value} sats, need more than {required}")]
    InsufficientFunds {
        /// Value of the selected head output.
        value: u64,
        /// `fee + dust_threshold`; the head must strictly exceed this.
        required: u64,
    },

    /// The encoded batch exceeds the payload limit even after compression.
    #[error("payload too large: {size} bytes after compression (limit {limit})")]
    PayloadTooLarge {
        /// Size of the compressed payload.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The address has no spendable output to extend the chain from.
    #[error("no spendable output for address {0}; fund it first")]
    NoSpendableOutput(String),

    /// The source transaction of the head could not be resolved or did not
    /// contain the expected output.
    #[error("source fetch failed for {txid}: {reason}")]
    SourceFetch {
        /// Transaction that was requested.
        txid: String,
        /// What went wrong.
        reason: String,
    },

    /// The key service refused or failed to produce an unlocking proof.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The broadcast was rejected or its outcome is unknown.
    ///
    /// When `ambiguous` is set the transaction may have been accepted; the
    /// caller must re-query the network before retrying.
    #[error("broadcast failed (ambiguous: {ambiguous}): {reason}")]
    Broadcast {
        /// Rejection reason or transport error.
        reason: String,
        /// `true` if the request may have reached the network.
        ambiguous: bool,
    },

    /// A network call exceeded its time bound.
    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout {
        /// The step that timed out.
        stage: NetworkStage,
        /// Configured bound.
        timeout_ms: u64,
    },

    /// A payload could not be decoded. Only produced by strict decoding;
    /// history reads degrade to raw entries instead.
    #[error("decode error: {0}")]
    Decode(String),

    /// History traversal hit its bound, found a cycle, or met a malformed
    /// transaction.
    #[error("chain integrity violation: {0}")]
    ChainIntegrity(String),

    /// The configuration cannot produce a working session.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A collaborator answered with something we could not use.
    #[error("service error: {0}")]
    Service(String),

    /// Staging document I/O failed.
    #[error("staging error: {0}")]
    Staging(#[from] StagingError),

    /// Head cache I/O failed.
    #[error("cache error: {0}")]
    Cache(#[from] DbError),

    /// Serializing or deserializing a structure failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A raw transaction could not be parsed.
    #[error("malformed transaction: {0}")]
    Transaction(#[from] TxDecodeError),
}

impl AuditError {
    /// `true` for failures that may have left a transaction on the network.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::Broadcast {
                ambiguous: true,
                ..
            } | Self::Timeout {
                stage: NetworkStage::Broadcast,
                ..
            }
        )
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::NoSpendableOutput(_) => "no_spendable_output",
            Self::SourceFetch { .. } => "source_fetch",
            Self::Signing(_) => "signing",
            Self::Broadcast { .. } => "broadcast",
            Self::Timeout { .. } => "timeout",
            Self::Decode(_) => "decode",
            Self::ChainIntegrity(_) => "chain_integrity",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Service(_) => "service",
            Self::Staging(_) => "staging",
            Self::Cache(_) => "cache",
            Self::Serialization(_) => "serialization",
            Self::Transaction(_) => "transaction",
        }
    }
}

/// Crate-wide result alias.
pub type AuditResult<T> = Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_timeout_is_ambiguous() {
        let err = AuditError::Timeout {
            stage: NetworkStage::Broadcast,
            timeout_ms: 10,
        };
        assert!(err.is_ambiguous());

        let err = AuditError::Timeout {
            stage: NetworkStage::TxFetch,
            timeout_ms: 10,
        };
        assert!(!err.is_ambiguous());
    }

    #[test]
    fn rejected_broadcast_is_not_ambiguous() {
        let err = AuditError::Broadcast {
            reason: "txn-mempool-conflict".to_string(),
            ambiguous: false,
        };
        assert!(!err.is_ambiguous());
        assert_eq!(err.kind(), "broadcast");
    }

    #[test]
    fn display_includes_amounts() {
        let err = AuditError::InsufficientFunds {
            value: 846,
            required: 846,
        };
        let msg = err.to_string();
        assert!(msg.contains("846"));
    }
}
