//! External collaborators.
//!
//! The writer and reader never talk to a node or a wallet directly. They go
//! through these traits, which the HTTP client, the in-memory ledger, and
//! the binary's external signer implement.

use std::sync::Arc;

use async_trait::async_trait;

use super::head::Utxo;
use crate::error::AuditResult;
use crate::transaction::{SigningContext, UnlockingProof};

/// Holds the key for one logging address.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// The address whose chain this key extends.
    fn address(&self) -> &str;

    /// Locking script for the change output, paying back to [`address`](Self::address).
    fn locking_script(&self) -> Vec<u8>;

    /// Produces the unlocking script for `ctx.input_index`.
    async fn sign(&self, ctx: &SigningContext) -> AuditResult<UnlockingProof>;
}

/// Lists unspent outputs.
#[async_trait]
pub trait UtxoQuery: Send + Sync {
    async fn list_unspent(&self, address: &str) -> AuditResult<Vec<Utxo>>;
}

/// Fetches raw transactions by id.
#[async_trait]
pub trait TxFetch: Send + Sync {
    async fn get_raw(&self, txid: &str) -> AuditResult<Vec<u8>>;
}

/// Submits signed transactions.
///
/// Returns the txid the network assigned. A rejection must come back as
/// [`AuditError::Broadcast`](crate::error::AuditError::Broadcast) with
/// `ambiguous: false`; a transport failure after the request may have left
/// the process must set `ambiguous: true`.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn submit(&self, raw: &[u8]) -> AuditResult<String>;
}

/// The three network-facing collaborators, bundled.
#[derive(Clone)]
pub struct ChainServices {
    pub utxos: Arc<dyn UtxoQuery>,
    pub fetch: Arc<dyn TxFetch>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl ChainServices {
    /// Uses one backend for all three roles.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UtxoQuery + TxFetch + Broadcaster + 'static,
    {
        Self {
            utxos: backend.clone(),
            fetch: backend.clone(),
            broadcaster: backend,
        }
    }
}

impl std::fmt::Debug for ChainServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainServices").finish_non_exhaustive()
    }
}
