//! # Audit Logger
//!
//! The session façade. An agent logs entries as it works and flushes at
//! natural boundaries; the logger decides, per its [`FlushMode`], whether a
//! flush becomes a chain link.
//!
//! ```text
//! log ──► BatchBuffer ──(flush)──► ChainWriter ──► ledger
//!             │                         │
//!        StagingStore               HeadCache
//! ```
//!
//! A flush either commits every entry it snapshotted and removes exactly
//! those from the buffer, or fails and leaves the buffer as it was.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::batch::{Batch, LogEntry};
use crate::buffer::BatchBuffer;
use crate::chain::head::ChainHead;
use crate::chain::reader::{ChainReader, ChainRecord};
use crate::chain::services::{ChainServices, KeyService};
use crate::chain::writer::{AddressRegistry, ChainWriter, CommitReceipt};
use crate::config::{AuditConfig, FlushMode, StagingMode};
use crate::error::{AuditError, AuditResult};
use crate::metrics::AuditMetrics;
use crate::storage::cache::HeadCache;
use crate::storage::staging::{FileStaging, MemoryStaging, StagingStore};

/// What a flush did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A link was committed.
    Committed(CommitReceipt),
    /// The session threshold was not met; entries stay pending.
    Deferred {
        /// Entries waiting.
        pending: usize,
    },
    /// Nothing to flush.
    Empty,
}

impl FlushOutcome {
    pub fn receipt(&self) -> Option<&CommitReceipt> {
        match self {
            Self::Committed(receipt) => Some(receipt),
            _ => None,
        }
    }
}

/// Assembles an [`AuditLogger`].
///
/// ```rust
/// use std::sync::Arc;
/// use auditchain_protocol::chain::{ChainServices, InMemoryLedger, KeyService, StaticKeyService};
/// use auditchain_protocol::config::AuditConfig;
/// use auditchain_protocol::logger::AuditLogger;
/// use auditchain_protocol::storage::HeadCache;
///
/// let ledger = Arc::new(InMemoryLedger::new());
/// let key = Arc::new(StaticKeyService::new("1DocAgent"));
/// ledger.fund(key.address(), key.locking_script(), 10_000);
///
/// let logger = AuditLogger::builder(AuditConfig::default(), key)
///     .services(ChainServices::from_backend(ledger))
///     .cache(HeadCache::open_temporary().unwrap())
///     .build()
///     .unwrap();
/// assert!(logger.pending().is_empty());
/// ```
pub struct AuditLoggerBuilder {
    config: AuditConfig,
    key: Arc<dyn KeyService>,
    services: Option<ChainServices>,
    cache: Option<HeadCache>,
    registry: Option<Arc<AddressRegistry>>,
    staging: Option<Arc<dyn StagingStore>>,
    staging_path: Option<PathBuf>,
    metrics: Option<AuditMetrics>,
}

impl AuditLoggerBuilder {
    /// UTXO query, transaction fetch and broadcast backends. Required.
    pub fn services(mut self, services: ChainServices) -> Self {
        self.services = Some(services);
        self
    }

    /// Head cache. Required.
    pub fn cache(mut self, cache: HeadCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Writer lock registry shared with other loggers in this process.
    /// A private one is created if omitted.
    pub fn registry(mut self, registry: Arc<AddressRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Staging document path, used when the config asks for durable staging.
    pub fn staging_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_path = Some(path.into());
        self
    }

    /// An explicit staging store, overriding the config's staging mode.
    pub fn staging(mut self, staging: Arc<dyn StagingStore>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn metrics(mut self, metrics: AuditMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validates the configuration, wires the components, and recovers any
    /// entries left staged by a previous run.
    pub fn build(self) -> AuditResult<AuditLogger> {
        self.config.validate().map_err(AuditError::InvalidConfig)?;
        let services = self
            .services
            .ok_or_else(|| AuditError::InvalidConfig("chain services are required".to_string()))?;
        let cache = self
            .cache
            .ok_or_else(|| AuditError::InvalidConfig("a head cache is required".to_string()))?;

        let staging: Arc<dyn StagingStore> = match (self.staging, self.config.staging_mode) {
            (Some(staging), _) => staging,
            (None, StagingMode::Memory) => Arc::new(MemoryStaging::new()),
            (None, StagingMode::Durable) => {
                let path = self.staging_path.ok_or_else(|| {
                    AuditError::InvalidConfig("durable staging requires a staging path".to_string())
                })?;
                Arc::new(FileStaging::new(path))
            }
        };

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => AuditMetrics::new().map_err(|e| AuditError::Service(e.to_string()))?,
        };
        let registry = self.registry.unwrap_or_default();

        let writer = ChainWriter::new(
            self.key,
            services.clone(),
            cache,
            registry,
            &self.config,
        )
        .with_metrics(metrics.clone());
        let reader = ChainReader::new(services.utxos, services.fetch, &self.config)
            .with_metrics(metrics.clone());

        let mut buffer = BatchBuffer::new(staging);
        buffer.reload()?;

        // Entries staged by an earlier process belong to a session that was
        // already running when they were logged.
        let session_start = earliest_timestamp(buffer.entries())
            .map_or_else(Utc::now, |ts| ts.min(Utc::now()));
        tracing::info!(
            address = writer.address(),
            agent_id = %self.config.agent_id,
            mode = ?self.config.mode,
            staging = ?self.config.staging_mode,
            recovered = buffer.len(),
            "audit session started"
        );

        Ok(AuditLogger {
            config: self.config,
            session_start,
            buffer,
            writer,
            reader,
            metrics,
        })
    }
}

/// One agent's audit session.
pub struct AuditLogger {
    config: AuditConfig,
    session_start: DateTime<Utc>,
    buffer: BatchBuffer,
    writer: ChainWriter,
    reader: ChainReader,
    metrics: AuditMetrics,
}

impl AuditLogger {
    pub fn builder(config: AuditConfig, key: Arc<dyn KeyService>) -> AuditLoggerBuilder {
        AuditLoggerBuilder {
            config,
            key,
            services: None,
            cache: None,
            registry: None,
            staging: None,
            staging_path: None,
            metrics: None,
        }
    }

    /// Records one entry, stamped with the current time.
    pub fn log(&mut self, fields: Map<String, Value>) -> AuditResult<()> {
        let entry = LogEntry::new(fields);
        self.buffer.append(entry)?;
        tracing::debug!(pending = self.buffer.len(), "entry logged");
        Ok(())
    }

    /// Records a JSON object.
    pub fn log_value(&mut self, value: Value) -> AuditResult<()> {
        let entry = LogEntry::from_value(value)?;
        self.buffer.append(entry)?;
        Ok(())
    }

    /// Flushes according to the configured mode.
    pub async fn flush(&mut self) -> AuditResult<FlushOutcome> {
        self.flush_inner(false).await
    }

    /// Commits whatever is pending, ignoring the session threshold.
    pub async fn force_flush(&mut self) -> AuditResult<FlushOutcome> {
        self.flush_inner(true).await
    }

    async fn flush_inner(&mut self, force: bool) -> AuditResult<FlushOutcome> {
        self.buffer.reload()?;
        if self.buffer.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        if let Some(ts) = earliest_timestamp(self.buffer.entries()) {
            self.session_start = self.session_start.min(ts);
        }
        if !self
            .buffer
            .ready(self.config.mode, self.config.min_batch_size, force)
        {
            let pending = self.buffer.len();
            tracing::debug!(pending, min = self.config.min_batch_size, "flush deferred");
            return Ok(FlushOutcome::Deferred { pending });
        }

        let snapshot = self.buffer.entries().to_vec();
        let batch = Batch::new(self.config.agent_id.clone(), self.session_start, snapshot);
        let receipt = self.writer.commit(&batch).await?;

        if let Err(e) = self.buffer.clear_committed(&batch.entries) {
            // The link is on chain. Leaving the entries staged means they
            // will be committed again, which at-least-once allows.
            tracing::error!(txid = %receipt.txid, error = %e, "committed entries could not be unstaged");
        }
        Ok(FlushOutcome::Committed(receipt))
    }

    /// Empties the buffer and staging without committing.
    pub fn discard(&mut self) -> AuditResult<usize> {
        let dropped = self.buffer.len();
        self.buffer.clear()?;
        if dropped > 0 {
            tracing::warn!(dropped, "pending entries discarded");
        }
        Ok(dropped)
    }

    /// This address's history, oldest link first.
    pub async fn history(&self) -> AuditResult<Vec<ChainRecord>> {
        self.reader.history(self.writer.address()).await
    }

    /// History ending at `txid`.
    pub async fn history_from(&self, txid: &str) -> AuditResult<Vec<ChainRecord>> {
        self.reader.history_from(txid).await
    }

    /// The head the next flush would spend.
    pub async fn current_head(&self) -> AuditResult<Option<ChainHead>> {
        self.writer.current_head().await
    }

    /// Entries not yet committed.
    pub fn pending(&self) -> &[LogEntry] {
        self.buffer.entries()
    }

    pub fn address(&self) -> &str {
        self.writer.address()
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    pub fn mode(&self) -> FlushMode {
        self.config.mode
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn metrics(&self) -> &AuditMetrics {
        &self.metrics
    }
}

fn earliest_timestamp(entries: &[LogEntry]) -> Option<DateTime<Utc>> {
    entries.iter().map(|e| e.ts).min()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{InMemoryLedger, StaticKeyService};
    use chrono::TimeZone;
    use serde_json::json;

    fn logger(config: AuditConfig) -> (Arc<InMemoryLedger>, AuditLogger) {
        let ledger = Arc::new(InMemoryLedger::new());
        let key = Arc::new(StaticKeyService::new("1Logger"));
        ledger.fund(key.address(), key.locking_script(), 20_000);
        let logger = AuditLogger::builder(config, key)
            .services(ChainServices::from_backend(ledger.clone()))
            .cache(HeadCache::open_temporary().unwrap())
            .build()
            .unwrap();
        (ledger, logger)
    }

    #[tokio::test]
    async fn session_start_covers_entries_staged_by_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let logged_at = Utc.timestamp_opt(Utc::now().timestamp() - 7_200, 0).unwrap();
        let fields = json!({"step": "earlier"}).as_object().cloned().unwrap();
        FileStaging::new(&path)
            .update(&mut |staged| staged.push(LogEntry::with_timestamp(fields.clone(), logged_at)))
            .unwrap();

        let ledger = Arc::new(InMemoryLedger::new());
        let key = Arc::new(StaticKeyService::new("1Logger"));
        ledger.fund(key.address(), key.locking_script(), 20_000);
        let config = AuditConfig {
            mode: FlushMode::Immediate,
            staging_mode: StagingMode::Durable,
            ..AuditConfig::default()
        };
        let mut logger = AuditLogger::builder(config, key)
            .services(ChainServices::from_backend(ledger))
            .cache(HeadCache::open_temporary().unwrap())
            .staging_path(&path)
            .build()
            .unwrap();
        assert_eq!(logger.session_start(), logged_at);

        logger.log_value(json!({"step": "now"})).unwrap();
        logger.flush().await.unwrap();
        let history = logger.history().await.unwrap();
        let batch = history[0].payload.batch().unwrap();
        assert_eq!(batch.session_start, logged_at);
        assert!(batch.entries.iter().all(|e| e.ts >= batch.session_start));
    }

    #[tokio::test]
    async fn empty_flush_does_nothing() {
        let (ledger, mut logger) = logger(AuditConfig::default());
        let before = ledger.transaction_count();
        assert_eq!(logger.flush().await.unwrap(), FlushOutcome::Empty);
        assert_eq!(ledger.transaction_count(), before);
    }

    #[tokio::test]
    async fn session_mode_waits_for_threshold() {
        let config = AuditConfig {
            mode: FlushMode::Session,
            min_batch_size: 3,
            ..AuditConfig::default()
        };
        let (_, mut logger) = logger(config);
        logger.log_value(json!({"step": 1})).unwrap();
        logger.log_value(json!({"step": 2})).unwrap();
        assert_eq!(
            logger.flush().await.unwrap(),
            FlushOutcome::Deferred { pending: 2 }
        );

        logger.log_value(json!({"step": 3})).unwrap();
        let outcome = logger.flush().await.unwrap();
        assert_eq!(outcome.receipt().unwrap().entries, 3);
        assert!(logger.pending().is_empty());
    }

    #[tokio::test]
    async fn force_flush_ignores_threshold() {
        let config = AuditConfig {
            mode: FlushMode::Session,
            min_batch_size: 10,
            ..AuditConfig::default()
        };
        let (_, mut logger) = logger(config);
        logger.log_value(json!({"step": 1})).unwrap();
        assert!(logger.force_flush().await.unwrap().receipt().is_some());
    }

    #[tokio::test]
    async fn immediate_mode_commits_every_flush() {
        let config = AuditConfig {
            mode: FlushMode::Immediate,
            min_batch_size: 10,
            ..AuditConfig::default()
        };
        let (_, mut logger) = logger(config);
        for step in 0..3 {
            logger.log_value(json!({ "step": step })).unwrap();
            assert!(logger.flush().await.unwrap().receipt().is_some());
        }
        assert_eq!(logger.history().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_flush_keeps_entries() {
        let (ledger, mut logger) = logger(AuditConfig::default());
        logger.log_value(json!({"step": 1})).unwrap();
        ledger.reject_next_broadcast("txn-mempool-conflict");
        assert!(logger.flush().await.is_err());
        assert_eq!(logger.pending().len(), 1);

        assert!(logger.flush().await.unwrap().receipt().is_some());
        assert!(logger.pending().is_empty());
    }

    #[tokio::test]
    async fn discard_drops_pending() {
        let (_, mut logger) = logger(AuditConfig::default());
        logger.log_value(json!({"step": 1})).unwrap();
        assert_eq!(logger.discard().unwrap(), 1);
        assert_eq!(logger.flush().await.unwrap(), FlushOutcome::Empty);
    }

    #[tokio::test]
    async fn metrics_track_commits() {
        let (_, mut logger) = logger(AuditConfig::default());
        logger.log_value(json!({"step": 1})).unwrap();
        logger.flush().await.unwrap();
        assert_eq!(logger.metrics().commits_total.get(), 1);
        assert_eq!(logger.metrics().entries_committed_total.get(), 1);
    }

    #[test]
    fn durable_mode_requires_a_path() {
        let config = AuditConfig {
            staging_mode: StagingMode::Durable,
            ..AuditConfig::default()
        };
        let ledger = Arc::new(InMemoryLedger::new());
        let result = AuditLogger::builder(config, Arc::new(StaticKeyService::new("1X")))
            .services(ChainServices::from_backend(ledger))
            .cache(HeadCache::open_temporary().unwrap())
            .build();
        assert!(matches!(result, Err(AuditError::InvalidConfig(_))));
    }

    #[test]
    fn log_rejects_non_objects() {
        let (_, mut logger) = logger(AuditConfig::default());
        assert!(logger.log_value(json!([1, 2])).is_err());
        assert!(logger.pending().is_empty());
    }
}
