//! In-process ledger and key service.
//!
//! [`InMemoryLedger`] plays UTXO service, transaction store, and broadcaster
//! at once. It enforces the rules that matter to an audit chain: inputs must
//! exist and be unspent, must carry an unlocking script, and outputs cannot
//! exceed inputs. It does not evaluate scripts.
//!
//! [`StaticKeyService`] produces deterministic placeholder unlocking
//! scripts. It exists for dry runs and tests; nothing it signs would be
//! accepted by a real node.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::head::{ChainHead, Utxo};
use super::services::{Broadcaster, KeyService, TxFetch, UtxoQuery};
use crate::config;
use crate::crypto::sha256;
use crate::error::{AuditError, AuditResult};
use crate::transaction::script::push_data;
use crate::transaction::{
    txid_of_raw, OutPoint, SigningContext, Transaction, TxInput, TxOutput, UnlockingProof,
};

#[derive(Debug, Clone)]
struct Unspent {
    address: String,
    value: u64,
    height: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    transactions: HashMap<String, Vec<u8>>,
    unspent: HashMap<OutPoint, Unspent>,
    owners: HashMap<Vec<u8>, String>,
    tip_height: u64,
    manual_mining: bool,
    funding_nonce: u64,
    reject_next: Option<String>,
    drop_next_response: bool,
    broadcast_delay: Duration,
}

impl LedgerState {
    /// Height for outputs created now.
    fn next_height(&mut self) -> u64 {
        if self.manual_mining {
            0
        } else {
            self.tip_height += 1;
            self.tip_height
        }
    }
}

/// A single-process ledger.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a funding transaction paying `value` to `locking_script` and
    /// registers the script as belonging to `address`.
    ///
    /// The funding transaction spends the root marker and carries no data,
    /// so history reads end there.
    pub fn fund(&self, address: &str, locking_script: Vec<u8>, value: u64) -> ChainHead {
        let mut state = self.state.lock();
        state.funding_nonce += 1;
        let nonce = state.funding_nonce;

        let tx = Transaction {
            version: config::CHAIN_TX_VERSION,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(config::ROOT_MARKER, u32::MAX),
                unlocking_script: nonce.to_le_bytes().to_vec(),
                sequence: config::FINAL_SEQUENCE,
            }],
            outputs: vec![TxOutput {
                value,
                locking_script: locking_script.clone(),
            }],
            lock_time: 0,
        };
        // The root marker is valid hex, so serialization cannot fail.
        let raw = tx.to_bytes().unwrap_or_default();
        let txid = txid_of_raw(&raw);

        let height = state.next_height();
        state.owners.insert(locking_script, address.to_string());
        state.unspent.insert(
            OutPoint::new(txid.clone(), 0),
            Unspent {
                address: address.to_string(),
                value,
                height,
            },
        );
        state.transactions.insert(txid.clone(), raw);
        tracing::debug!(address, txid = %txid, value, "ledger funded address");
        ChainHead::new(txid, 0, value)
    }

    /// When set, new outputs stay unconfirmed (height 0) until
    /// [`mine_block`](Self::mine_block).
    pub fn set_manual_mining(&self, manual: bool) {
        self.state.lock().manual_mining = manual;
    }

    /// Confirms every unconfirmed output at the next height.
    pub fn mine_block(&self) -> u64 {
        let mut state = self.state.lock();
        state.tip_height += 1;
        let height = state.tip_height;
        for utxo in state.unspent.values_mut().filter(|u| u.height == 0) {
            utxo.height = height;
        }
        height
    }

    /// The next broadcast is rejected with `reason`.
    pub fn reject_next_broadcast(&self, reason: impl Into<String>) {
        self.state.lock().reject_next = Some(reason.into());
    }

    /// The next broadcast is accepted but reported as a lost response.
    pub fn drop_next_response(&self) {
        self.state.lock().drop_next_response = true;
    }

    /// Every broadcast waits `delay` before being processed.
    pub fn set_broadcast_delay(&self, delay: Duration) {
        self.state.lock().broadcast_delay = delay;
    }

    /// Transactions known to the ledger, funding included.
    pub fn transaction_count(&self) -> usize {
        self.state.lock().transactions.len()
    }

    /// Inserts a raw transaction without validation. Lets tests build
    /// malformed or cyclic histories.
    pub fn insert_raw(&self, txid: impl Into<String>, raw: Vec<u8>) {
        self.state.lock().transactions.insert(txid.into(), raw);
    }

    fn apply(&self, raw: &[u8]) -> AuditResult<String> {
        let reject = |reason: String| AuditError::Broadcast {
            reason,
            ambiguous: false,
        };

        let tx = Transaction::from_bytes(raw).map_err(|e| reject(format!("malformed: {e}")))?;
        let txid = txid_of_raw(raw);

        let mut state = self.state.lock();
        if let Some(reason) = state.reject_next.take() {
            return Err(reject(reason));
        }
        if state.transactions.contains_key(&txid) {
            return Ok(txid);
        }

        let mut input_value = 0u64;
        for input in &tx.inputs {
            let spent = state
                .unspent
                .get(&input.previous_output)
                .ok_or_else(|| reject(format!("missing or spent input {}", input.previous_output)))?;
            if input.unlocking_script.is_empty() {
                return Err(reject(format!(
                    "input {} has no unlocking script",
                    input.previous_output
                )));
            }
            input_value = input_value.saturating_add(spent.value);
        }
        let output_value = tx.total_output_value();
        if output_value > input_value {
            return Err(reject(format!(
                "outputs {output_value} exceed inputs {input_value}"
            )));
        }

        for input in &tx.inputs {
            state.unspent.remove(&input.previous_output);
        }
        let height = state.next_height();
        for (index, output) in tx.outputs.iter().enumerate() {
            if output.is_data_carrier() {
                continue;
            }
            if let Some(address) = state.owners.get(&output.locking_script).cloned() {
                state.unspent.insert(
                    OutPoint::new(txid.clone(), index as u32),
                    Unspent {
                        address,
                        value: output.value,
                        height,
                    },
                );
            }
        }
        state.transactions.insert(txid.clone(), raw.to_vec());

        if std::mem::take(&mut state.drop_next_response) {
            return Err(AuditError::Broadcast {
                reason: "connection reset after submit".to_string(),
                ambiguous: true,
            });
        }
        Ok(txid)
    }
}

#[async_trait]
impl UtxoQuery for InMemoryLedger {
    async fn list_unspent(&self, address: &str) -> AuditResult<Vec<Utxo>> {
        let state = self.state.lock();
        Ok(state
            .unspent
            .iter()
            .filter(|(_, u)| u.address == address)
            .map(|(outpoint, u)| Utxo {
                txid: outpoint.txid.clone(),
                output_index: outpoint.index,
                value: u.value,
                height: u.height,
            })
            .collect())
    }
}

#[async_trait]
impl TxFetch for InMemoryLedger {
    async fn get_raw(&self, txid: &str) -> AuditResult<Vec<u8>> {
        self.state
            .lock()
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| AuditError::Service(format!("transaction {txid} not found")))
    }
}

#[async_trait]
impl Broadcaster for InMemoryLedger {
    async fn submit(&self, raw: &[u8]) -> AuditResult<String> {
        let delay = self.state.lock().broadcast_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.apply(raw)
    }
}

// ---------------------------------------------------------------------------
// StaticKeyService
// ---------------------------------------------------------------------------

/// Deterministic key service for dry runs.
#[derive(Debug, Clone)]
pub struct StaticKeyService {
    address: String,
    locking_script: Vec<u8>,
}

impl StaticKeyService {
    /// A key for `address` whose change script is a P2PKH-shaped script
    /// derived from the address.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let digest = sha256(address.as_bytes());
        let mut locking_script = vec![0x76, 0xa9, 0x14];
        locking_script.extend_from_slice(&digest[..20]);
        locking_script.extend_from_slice(&[0x88, 0xac]);
        Self {
            address,
            locking_script,
        }
    }
}

#[async_trait]
impl KeyService for StaticKeyService {
    fn address(&self) -> &str {
        &self.address
    }

    fn locking_script(&self) -> Vec<u8> {
        self.locking_script.clone()
    }

    async fn sign(&self, ctx: &SigningContext) -> AuditResult<UnlockingProof> {
        if ctx.address != self.address {
            return Err(AuditError::Signing(format!(
                "no key for address {}",
                ctx.address
            )));
        }
        let unsigned = ctx.transaction.to_bytes()?;
        let mut preimage = sha256(&unsigned).to_vec();
        preimage.extend_from_slice(&(ctx.input_index as u32).to_le_bytes());
        preimage.extend_from_slice(&ctx.source_output.value.to_le_bytes());
        preimage.extend_from_slice(self.address.as_bytes());
        let signature = sha256(&preimage);

        let mut pubkey = vec![0x02];
        pubkey.extend_from_slice(&sha256(self.address.as_bytes()));

        let mut script = Vec::new();
        push_data(&mut script, &signature);
        push_data(&mut script, &pubkey);
        Ok(UnlockingProof(script))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{apply_unlocking_proof, ChainLinkBuilder};

    fn link_from(head: &ChainHead, key: &StaticKeyService) -> Transaction {
        ChainLinkBuilder::new(head.clone())
            .payload(b"{}".to_vec())
            .change_script(key.locking_script())
            .build()
            .unwrap()
            .transaction
    }

    async fn signed(ledger: &InMemoryLedger, head: &ChainHead, key: &StaticKeyService) -> Vec<u8> {
        let tx = link_from(head, key);
        let raw = ledger.get_raw(&head.txid).await.unwrap();
        let source = Transaction::from_bytes(&raw).unwrap().outputs[head.output_index as usize].clone();
        let ctx = SigningContext {
            address: key.address().to_string(),
            transaction: tx,
            input_index: 0,
            source_output: source,
        };
        let proof = key.sign(&ctx).await.unwrap();
        apply_unlocking_proof(ctx.transaction, 0, proof)
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    #[tokio::test]
    async fn funding_creates_spendable_output() {
        let ledger = InMemoryLedger::new();
        let key = StaticKeyService::new("1Funded");
        let head = ledger.fund(key.address(), key.locking_script(), 5_000);

        let utxos = ledger.list_unspent("1Funded").await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].txid, head.txid);
        assert_eq!(utxos[0].height, 1);
        assert!(ledger.list_unspent("1Other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spend_moves_the_head() {
        let ledger = InMemoryLedger::new();
        let key = StaticKeyService::new("1Spender");
        let head = ledger.fund(key.address(), key.locking_script(), 5_000);

        let raw = signed(&ledger, &head, &key).await;
        let txid = ledger.submit(&raw).await.unwrap();

        let utxos = ledger.list_unspent("1Spender").await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].txid, txid);
        assert_eq!(utxos[0].output_index, config::CHANGE_OUTPUT_INDEX);
        assert_eq!(utxos[0].value, 5_000 - config::DEFAULT_FEE_SATS);
    }

    #[tokio::test]
    async fn double_spend_is_rejected() {
        let ledger = InMemoryLedger::new();
        let key = StaticKeyService::new("1Spender");
        let head = ledger.fund(key.address(), key.locking_script(), 5_000);
        let raw = signed(&ledger, &head, &key).await;
        ledger.submit(&raw).await.unwrap();

        let conflicting = ChainLinkBuilder::new(head.clone())
            .payload(b"other".to_vec())
            .change_script(key.locking_script())
            .build()
            .unwrap()
            .transaction;
        let conflicting = apply_unlocking_proof(conflicting, 0, UnlockingProof(vec![1]))
            .unwrap()
            .to_bytes()
            .unwrap();
        assert!(matches!(
            ledger.submit(&conflicting).await,
            Err(AuditError::Broadcast { ambiguous: false, .. })
        ));
    }

    #[tokio::test]
    async fn unsigned_spend_is_rejected() {
        let ledger = InMemoryLedger::new();
        let key = StaticKeyService::new("1Spender");
        let head = ledger.fund(key.address(), key.locking_script(), 5_000);
        let raw = link_from(&head, &key).to_bytes().unwrap();
        assert!(ledger.submit(&raw).await.is_err());
    }

    #[tokio::test]
    async fn dropped_response_still_applies() {
        let ledger = InMemoryLedger::new();
        let key = StaticKeyService::new("1Spender");
        let head = ledger.fund(key.address(), key.locking_script(), 5_000);
        let raw = signed(&ledger, &head, &key).await;

        ledger.drop_next_response();
        let err = ledger.submit(&raw).await.unwrap_err();
        assert!(err.is_ambiguous());
        assert!(ledger.get_raw(&txid_of_raw(&raw)).await.is_ok());
    }

    #[tokio::test]
    async fn manual_mining_leaves_outputs_unconfirmed() {
        let ledger = InMemoryLedger::new();
        ledger.set_manual_mining(true);
        ledger.fund("1Pending", vec![0x51], 1_000);
        assert_eq!(ledger.list_unspent("1Pending").await.unwrap()[0].height, 0);

        let height = ledger.mine_block();
        assert_eq!(ledger.list_unspent("1Pending").await.unwrap()[0].height, height);
    }

    #[tokio::test]
    async fn static_key_is_deterministic() {
        let key = StaticKeyService::new("1Det");
        let ledger = InMemoryLedger::new();
        let head = ledger.fund(key.address(), key.locking_script(), 5_000);
        let a = signed(&ledger, &head, &key).await;
        let b = signed(&ledger, &head, &key).await;
        assert_eq!(a, b);
    }
}
