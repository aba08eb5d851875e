//! # Chain Writer
//!
//! Commits one batch as one chain link. A run walks a fixed sequence of
//! states:
//!
//! ```text
//! Idle → SelectingHead → FetchingSource → Building → Signing → Broadcasting
//!                                                                   │
//!                                                        Committed ◄┴► Failed
//! ```
//!
//! Nothing persistent is touched before `Broadcasting`, so a run cancelled
//! earlier is harmless. From `Broadcasting` on, a lost response means the
//! link may or may not be on chain; such failures are reported as
//! ambiguous and the cached head is dropped so the next run asks the
//! network.
//!
//! Runs for the same address are serialized through an [`AddressRegistry`].
//! Two concurrent runs would otherwise race to spend the same head and the
//! loser would be rejected.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::head::{select_head, ChainHead};
use super::services::{ChainServices, KeyService};
use crate::batch::Batch;
use crate::codec::{self, Encoding};
use crate::config::{self, AuditConfig};
use crate::error::{AuditError, AuditResult, NetworkStage};
use crate::metrics::AuditMetrics;
use crate::storage::cache::HeadCache;
use crate::transaction::{
    apply_unlocking_proof, txid_of_raw, ChainLinkBuilder, SigningContext, Transaction, TxOutput,
};

/// Where a writer run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    SelectingHead,
    FetchingSource,
    Building,
    Signing,
    Broadcasting,
    Committed,
    Failed,
}

impl std::fmt::Display for WriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SelectingHead => "selecting_head",
            Self::FetchingSource => "fetching_source",
            Self::Building => "building",
            Self::Signing => "signing",
            Self::Broadcasting => "broadcasting",
            Self::Committed => "committed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-address writer locks.
///
/// Owned by whoever owns the session and shared by every writer that may
/// touch the same addresses. Entries are never removed; there is one per
/// address ever written, which stays small.
#[derive(Debug, Default)]
pub struct AddressRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `address`, created on first use.
    pub fn lock_for(&self, address: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of addresses seen.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Id of the new link.
    pub txid: String,
    /// The change output, now the chain head.
    pub new_head: ChainHead,
    /// The head that was spent.
    pub spent: ChainHead,
    /// Encoded payload size.
    pub payload_bytes: usize,
    /// Whether the payload was compressed.
    pub encoding: Encoding,
    /// Entries carried.
    pub entries: usize,
}

/// Where the head of a run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadSource {
    Cache,
    Network,
}

/// Commits batches to an address's chain.
pub struct ChainWriter {
    key: Arc<dyn KeyService>,
    services: ChainServices,
    cache: HeadCache,
    registry: Arc<AddressRegistry>,
    metrics: Option<AuditMetrics>,
    fee: u64,
    dust_threshold: u64,
    max_payload_bytes: usize,
    timeout: Duration,
}

impl ChainWriter {
    pub fn new(
        key: Arc<dyn KeyService>,
        services: ChainServices,
        cache: HeadCache,
        registry: Arc<AddressRegistry>,
        config: &AuditConfig,
    ) -> Self {
        Self {
            key,
            services,
            cache,
            registry,
            metrics: None,
            fee: config.fee_sats,
            dust_threshold: config.dust_threshold_sats,
            max_payload_bytes: config.max_payload_bytes,
            timeout: config.network_timeout(),
        }
    }

    /// Records into `metrics`.
    pub fn with_metrics(mut self, metrics: AuditMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The address this writer extends.
    pub fn address(&self) -> &str {
        self.key.address()
    }

    /// The head the next run would spend, from the cache or the network.
    pub async fn current_head(&self) -> AuditResult<Option<ChainHead>> {
        let address = self.key.address();
        if let Some(head) = self.cache.get(address)? {
            return Ok(Some(head));
        }
        let utxos = self
            .bounded(NetworkStage::UtxoQuery, self.services.utxos.list_unspent(address))
            .await?;
        Ok(select_head(&utxos))
    }

    /// Commits `batch` as one chain link.
    ///
    /// On failure nothing has changed locally except, for broadcast
    /// failures, the cached head being dropped.
    pub async fn commit(&self, batch: &Batch) -> AuditResult<CommitReceipt> {
        let address = self.key.address().to_string();
        let lock = self.registry.lock_for(&address);
        let _guard = lock.lock().await;

        let started = Instant::now();
        let mut state = WriterState::Idle;
        let mut head_source = None;
        let result = self.run(batch, &mut state, &mut head_source).await;

        if let Some(metrics) = &self.metrics {
            metrics
                .commit_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(receipt) => {
                if let Some(metrics) = &self.metrics {
                    metrics.commits_total.inc();
                    metrics.entries_committed_total.inc_by(receipt.entries as u64);
                    metrics.payload_bytes.observe(receipt.payload_bytes as f64);
                    if receipt.encoding == Encoding::Gzip {
                        metrics.compressed_payloads_total.inc();
                    }
                }
                tracing::info!(
                    address = %address,
                    txid = %receipt.txid,
                    entries = receipt.entries,
                    payload_bytes = receipt.payload_bytes,
                    change = receipt.new_head.value,
                    "chain link committed"
                );
                Ok(receipt)
            }
            Err(e) => {
                let failed_in = state;
                self.transition(&mut state, WriterState::Failed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(e.kind());
                }
                let stale_cache = failed_in == WriterState::Broadcasting
                    || (failed_in == WriterState::FetchingSource
                        && head_source == Some(HeadSource::Cache));
                if stale_cache {
                    self.drop_cached_head(&address);
                }
                tracing::warn!(
                    address = %address,
                    state = %failed_in,
                    kind = e.kind(),
                    ambiguous = e.is_ambiguous(),
                    error = %e,
                    "chain link not committed"
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        batch: &Batch,
        state: &mut WriterState,
        head_source: &mut Option<HeadSource>,
    ) -> AuditResult<CommitReceipt> {
        let address = self.key.address();
        let payload = codec::encode(batch, self.max_payload_bytes)?;

        // --- SelectingHead ---------------------------------------------------
        self.transition(state, WriterState::SelectingHead);
        let head = match self.cache.get(address)? {
            Some(head) => {
                *head_source = Some(HeadSource::Cache);
                head
            }
            None => {
                *head_source = Some(HeadSource::Network);
                let utxos = self
                    .bounded(NetworkStage::UtxoQuery, self.services.utxos.list_unspent(address))
                    .await?;
                select_head(&utxos)
                    .ok_or_else(|| AuditError::NoSpendableOutput(address.to_string()))?
            }
        };
        tracing::debug!(address, head = %head, source = ?head_source, "head selected");

        // --- FetchingSource --------------------------------------------------
        self.transition(state, WriterState::FetchingSource);
        let source_output = self.fetch_source_output(&head).await?;

        // --- Building --------------------------------------------------------
        self.transition(state, WriterState::Building);
        let link = ChainLinkBuilder::new(head.clone())
            .payload(payload.bytes.clone())
            .change_script(self.key.locking_script())
            .fee(self.fee)
            .dust_threshold(self.dust_threshold)
            .build()?;

        // --- Signing ---------------------------------------------------------
        self.transition(state, WriterState::Signing);
        let ctx = SigningContext {
            address: address.to_string(),
            transaction: link.transaction,
            input_index: 0,
            source_output,
        };
        let proof = match tokio::time::timeout(self.timeout, self.key.sign(&ctx)).await {
            Ok(proof) => proof?,
            Err(_) => {
                return Err(AuditError::Signing(format!(
                    "key service did not answer within {}ms",
                    self.timeout.as_millis()
                )))
            }
        };
        let signed = apply_unlocking_proof(ctx.transaction, ctx.input_index, proof)?;
        let raw = signed.to_bytes()?;
        let txid = txid_of_raw(&raw);

        // --- Broadcasting ----------------------------------------------------
        self.transition(state, WriterState::Broadcasting);
        let accepted = self
            .bounded(NetworkStage::Broadcast, self.services.broadcaster.submit(&raw))
            .await?;
        if !accepted.eq_ignore_ascii_case(&txid) {
            tracing::warn!(computed = %txid, reported = %accepted, "broadcaster reported a different txid");
        }

        // --- Committed -------------------------------------------------------
        self.transition(state, WriterState::Committed);
        let new_head = ChainHead::new(txid.clone(), config::CHANGE_OUTPUT_INDEX, link.change_value);
        if let Err(e) = self.cache.put(address, &new_head) {
            // The link is on chain; a missing cache entry only costs a query.
            tracing::warn!(address, error = %e, "failed to cache new head");
            self.drop_cached_head(address);
        }

        Ok(CommitReceipt {
            txid,
            new_head,
            spent: head,
            payload_bytes: payload.len(),
            encoding: payload.encoding,
            entries: batch.len(),
        })
    }

    /// Resolves the output `head` refers to and checks it matches.
    async fn fetch_source_output(&self, head: &ChainHead) -> AuditResult<TxOutput> {
        let fail = |reason: String| AuditError::SourceFetch {
            txid: head.txid.clone(),
            reason,
        };

        let raw = self
            .bounded(NetworkStage::TxFetch, self.services.fetch.get_raw(&head.txid))
            .await
            .map_err(|e| match e {
                AuditError::Timeout { .. } => e,
                other => fail(other.to_string()),
            })?;

        let actual = txid_of_raw(&raw);
        if !actual.eq_ignore_ascii_case(&head.txid) {
            return Err(fail(format!("service returned transaction {actual}")));
        }
        let tx = Transaction::from_bytes(&raw).map_err(|e| fail(e.to_string()))?;
        let output = tx
            .outputs
            .get(head.output_index as usize)
            .cloned()
            .ok_or_else(|| fail(format!("no output at index {}", head.output_index)))?;
        if output.value != head.value {
            return Err(fail(format!(
                "output {} holds {} sats, expected {}",
                head.output_index, output.value, head.value
            )));
        }
        Ok(output)
    }

    /// Runs a network call under the configured timeout.
    async fn bounded<T, F>(&self, stage: NetworkStage, call: F) -> AuditResult<T>
    where
        F: Future<Output = AuditResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AuditError::Timeout {
                stage,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    fn transition(&self, state: &mut WriterState, next: WriterState) {
        let from = *state;
        tracing::debug!(address = self.key.address(), from = %from, to = %next, "writer state");
        *state = next;
    }

    fn drop_cached_head(&self, address: &str) {
        match self.cache.invalidate(address) {
            Ok(true) => tracing::warn!(address, "cached head invalidated"),
            Ok(false) => {}
            Err(e) => tracing::error!(address, error = %e, "failed to invalidate cached head"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
