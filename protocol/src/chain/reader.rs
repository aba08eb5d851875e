//! # Chain Reader
//!
//! Rebuilds an address's audit history by walking the chain backward from
//! its head. Each link's primary input points at the previous link, so the
//! walk is: fetch, decode the data carrier, step to input 0, repeat.
//!
//! The walk ends at the root marker, or at the first transaction without a
//! data carrier (the funding transaction that started the chain). It
//! refuses to run forever: a repeated txid or a walk longer than the depth
//! bound is a [`AuditError::ChainIntegrity`] failure, never a silently
//! truncated history.
//!
//! Undecodable payloads do not stop the walk. They come back as
//! [`DecodedPayload::Raw`] in their place.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::head::select_head;
use super::services::{TxFetch, UtxoQuery};
use crate::codec::{self, DecodedPayload};
use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult, NetworkStage};
use crate::metrics::AuditMetrics;
use crate::transaction::script::extract_payload;
use crate::transaction::{txid_of_raw, Transaction};

/// One link of the history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainRecord {
    /// The link's txid.
    pub txid: String,
    /// What it carried.
    pub payload: DecodedPayload,
}

/// Walks chains backward.
pub struct ChainReader {
    utxos: Arc<dyn UtxoQuery>,
    fetch: Arc<dyn TxFetch>,
    max_depth: usize,
    timeout: Duration,
    metrics: Option<AuditMetrics>,
}

impl ChainReader {
    pub fn new(utxos: Arc<dyn UtxoQuery>, fetch: Arc<dyn TxFetch>, config: &AuditConfig) -> Self {
        Self {
            utxos,
            fetch,
            max_depth: config.max_traversal_depth,
            timeout: config.network_timeout(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AuditMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Full history of `address`, oldest link first.
    ///
    /// The starting point is the head as the network reports it; the local
    /// cache is not consulted. An address with no unspent output has no
    /// readable chain and yields an empty history.
    pub async fn history(&self, address: &str) -> AuditResult<Vec<ChainRecord>> {
        let utxos = match tokio::time::timeout(self.timeout, self.utxos.list_unspent(address)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(AuditError::Timeout {
                    stage: NetworkStage::UtxoQuery,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };
        match select_head(&utxos) {
            Some(head) => self.history_from(&head.txid).await,
            None => {
                tracing::info!(address, "no unspent output; history is empty");
                Ok(Vec::new())
            }
        }
    }

    /// History ending at `txid`, oldest link first.
    pub async fn history_from(&self, txid: &str) -> AuditResult<Vec<ChainRecord>> {
        let mut records = Vec::new();
        let mut visited = HashSet::new();
        let mut current = txid.to_string();

        loop {
            if !visited.insert(current.clone()) {
                return Err(AuditError::ChainIntegrity(format!(
                    "cycle: {current} visited twice"
                )));
            }

            let tx = self.fetch_verified(&current).await?;
            if let Some(metrics) = &self.metrics {
                metrics.links_walked_total.inc();
            }

            let Some((_, carrier)) = tx.data_carrier() else {
                tracing::debug!(txid = %current, "reached transaction without data carrier");
                break;
            };

            let payload = match extract_payload(&carrier.locking_script) {
                Ok(bytes) => codec::decode(&bytes),
                Err(e) => DecodedPayload::Raw {
                    hex: hex::encode(&carrier.locking_script),
                    reason: e.to_string(),
                },
            };
            if let DecodedPayload::Raw { reason, .. } = &payload {
                tracing::warn!(txid = %current, reason = %reason, "payload returned raw");
                if let Some(metrics) = &self.metrics {
                    metrics.raw_payloads_total.inc();
                }
            }
            // Only payload-carrying links count; the funding transaction
            // that ends the walk does not.
            if records.len() >= self.max_depth {
                return Err(AuditError::ChainIntegrity(format!(
                    "history of {txid} exceeds {} links",
                    self.max_depth
                )));
            }
            records.push(ChainRecord {
                txid: current.clone(),
                payload,
            });

            let previous = tx.primary_input().ok_or_else(|| {
                AuditError::ChainIntegrity(format!("link {current} has no inputs"))
            })?;
            if previous.previous_output.is_root() {
                break;
            }
            current = previous.previous_output.txid.clone();
        }

        records.reverse();
        tracing::debug!(start = txid, links = records.len(), "history read");
        Ok(records)
    }

    async fn fetch_verified(&self, txid: &str) -> AuditResult<Transaction> {
        let raw = match tokio::time::timeout(self.timeout, self.fetch.get_raw(txid)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AuditError::Timeout {
                    stage: NetworkStage::TxFetch,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };
        let actual = txid_of_raw(&raw);
        if !actual.eq_ignore_ascii_case(txid) {
            return Err(AuditError::ChainIntegrity(format!(
                "requested {txid}, service returned {actual}"
            )));
        }
        Transaction::from_bytes(&raw)
            .map_err(|e| AuditError::ChainIntegrity(format!("malformed link {txid}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, LogEntry};
    use crate::chain::memory::{InMemoryLedger, StaticKeyService};
    use crate::chain::services::{ChainServices, KeyService};
    use crate::chain::writer::{AddressRegistry, ChainWriter};
    use crate::config;
    use crate::storage::cache::HeadCache;
    use crate::transaction::script::data_carrier_script;
    use crate::transaction::{OutPoint, TxInput, TxOutput};
    use chrono::Utc;
    use serde_json::json;

    const ADDRESS: &str = "1Reader";

    fn setup() -> (Arc<InMemoryLedger>, ChainWriter, ChainReader) {
        let ledger = Arc::new(InMemoryLedger::new());
        let key = Arc::new(StaticKeyService::new(ADDRESS));
        ledger.fund(ADDRESS, key.locking_script(), 50_000);
        let config = AuditConfig::default();
        let writer = ChainWriter::new(
            key,
            ChainServices::from_backend(ledger.clone()),
            HeadCache::open_temporary().unwrap(),
            Arc::new(AddressRegistry::new()),
            &config,
        );
        let reader = ChainReader::new(ledger.clone(), ledger.clone(), &config);
        (ledger, writer, reader)
    }

    fn batch(n: i64) -> Batch {
        let entry = LogEntry::from_value(json!({ "seq": n })).unwrap();
        Batch::new("agent", Utc::now(), vec![entry])
    }

    fn seq(record: &ChainRecord) -> i64 {
        record.payload.batch().unwrap().entries[0]
            .get("seq")
            .and_then(|v| v.as_i64())
            .unwrap()
    }

    /// A link spending `prev` whose txid is computed, stored unvalidated.
    fn forged_link(ledger: &InMemoryLedger, prev: &str, payload: &[u8]) -> String {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(prev, 1),
                unlocking_script: vec![0x01, 0x00],
                sequence: config::FINAL_SEQUENCE,
            }],
            outputs: vec![
                TxOutput {
                    value: 0,
                    locking_script: data_carrier_script(payload),
                },
                TxOutput {
                    value: 1_000,
                    locking_script: vec![0x51],
                },
            ],
            lock_time: 0,
        };
        let raw = tx.to_bytes().unwrap();
        let txid = txid_of_raw(&raw);
        ledger.insert_raw(txid.clone(), raw);
        txid
    }

    #[tokio::test]
    async fn empty_chain_has_empty_history() {
        let (_, _, reader) = setup();
        assert!(reader.history(ADDRESS).await.unwrap().is_empty());
        assert!(reader.history("1Nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_chronological() {
        let (_, writer, reader) = setup();
        for n in 0..5 {
            writer.commit(&batch(n)).await.unwrap();
        }
        let history = reader.history(ADDRESS).await.unwrap();
        let order: Vec<i64> = history.iter().map(seq).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn history_from_intermediate_link() {
        let (_, writer, reader) = setup();
        writer.commit(&batch(0)).await.unwrap();
        let middle = writer.commit(&batch(1)).await.unwrap();
        writer.commit(&batch(2)).await.unwrap();

        let partial = reader.history_from(&middle.txid).await.unwrap();
        assert_eq!(partial.iter().map(seq).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn foreign_payload_degrades_to_raw() {
        let (ledger, writer, reader) = setup();
        let first = writer.commit(&batch(0)).await.unwrap();
        let tip = forged_link(&ledger, &first.txid, b"not a batch");

        let history = reader.history_from(&tip).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].payload.batch().is_some());
        assert!(history[1].payload.is_raw());
    }

    #[tokio::test]
    async fn root_marker_ends_the_walk() {
        let (ledger, _, reader) = setup();
        let tip = forged_link(&ledger, config::ROOT_MARKER, br#"{"x":1}"#);
        let history = reader.history_from(&tip).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn depth_bound_is_enforced() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut tip = config::ROOT_MARKER.to_string();
        for n in 0..4 {
            tip = forged_link(&ledger, &tip, format!("{n}").as_bytes());
        }
        let config = AuditConfig {
            max_traversal_depth: 3,
            ..AuditConfig::default()
        };
        let reader = ChainReader::new(ledger.clone(), ledger.clone(), &config);
        assert!(matches!(
            reader.history_from(&tip).await,
            Err(AuditError::ChainIntegrity(_))
        ));
    }

    #[tokio::test]
    async fn chain_exactly_at_the_depth_bound_reads_fully() {
        let ledger = Arc::new(InMemoryLedger::new());
        let key = Arc::new(StaticKeyService::new(ADDRESS));
        ledger.fund(ADDRESS, key.locking_script(), 50_000);
        let config = AuditConfig {
            max_traversal_depth: 3,
            ..AuditConfig::default()
        };
        let writer = ChainWriter::new(
            key,
            ChainServices::from_backend(ledger.clone()),
            HeadCache::open_temporary().unwrap(),
            Arc::new(AddressRegistry::new()),
            &config,
        );
        for n in 0..3 {
            writer.commit(&batch(n)).await.unwrap();
        }

        let reader = ChainReader::new(ledger.clone(), ledger.clone(), &config);
        let history = reader.history(ADDRESS).await.unwrap();
        assert_eq!(history.iter().map(seq).collect::<Vec<_>>(), vec![0, 1, 2]);

        writer.commit(&batch(3)).await.unwrap();
        assert!(matches!(
            reader.history(ADDRESS).await,
            Err(AuditError::ChainIntegrity(_))
        ));
    }

    #[tokio::test]
    async fn rooted_chain_at_the_depth_bound_reads_fully() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut tip = config::ROOT_MARKER.to_string();
        for n in 0..3 {
            tip = forged_link(&ledger, &tip, format!("{n}").as_bytes());
        }
        let config = AuditConfig {
            max_traversal_depth: 3,
            ..AuditConfig::default()
        };
        let reader = ChainReader::new(ledger.clone(), ledger.clone(), &config);
        assert_eq!(reader.history_from(&tip).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn substituted_transaction_is_an_integrity_error() {
        let (ledger, writer, reader) = setup();
        let first = writer.commit(&batch(0)).await.unwrap();
        let other = forged_link(&ledger, config::ROOT_MARKER, b"x");
        let raw = ledger.get_raw(&other).await.unwrap();
        ledger.insert_raw(first.txid.clone(), raw);

        assert!(matches!(
            reader.history_from(&first.txid).await,
            Err(AuditError::ChainIntegrity(_))
        ));
    }

    #[tokio::test]
    async fn missing_link_surfaces_service_error() {
        let (_, _, reader) = setup();
        assert!(reader.history_from(&"ab".repeat(32)).await.is_err());
    }
}
