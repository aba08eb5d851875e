//! # Prometheus Metrics
//!
//! Operational counters for writes and history reads. All metrics live in a
//! dedicated [`prometheus::Registry`] prefixed `auditchain`, so embedding
//! applications can expose them next to their own without collisions.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Metric handles for one audit session.
///
/// Cheap to clone: prometheus handles are reference-counted.
#[derive(Clone)]
pub struct AuditMetrics {
    registry: Registry,
    /// Chain links successfully broadcast.
    pub commits_total: IntCounter,
    /// Failed commit attempts, by error kind.
    pub commit_failures_total: IntCounterVec,
    /// Log entries carried by committed links.
    pub entries_committed_total: IntCounter,
    /// Committed payloads that needed gzip.
    pub compressed_payloads_total: IntCounter,
    /// Encoded payload size of committed links.
    pub payload_bytes: Histogram,
    /// Wall time of a commit attempt, success or not.
    pub commit_duration_seconds: Histogram,
    /// Transactions visited by history reads.
    pub links_walked_total: IntCounter,
    /// Payloads that history reads could only return raw.
    pub raw_payloads_total: IntCounter,
}

impl std::fmt::Debug for AuditMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditMetrics")
            .field("commits_total", &self.commits_total.get())
            .finish_non_exhaustive()
    }
}

impl AuditMetrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("auditchain".into()), None)?;

        let commits_total = IntCounter::new("commits_total", "Chain links successfully broadcast")?;
        registry.register(Box::new(commits_total.clone()))?;

        let commit_failures_total = IntCounterVec::new(
            Opts::new("commit_failures_total", "Failed commit attempts by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(commit_failures_total.clone()))?;

        let entries_committed_total = IntCounter::new(
            "entries_committed_total",
            "Log entries carried by committed links",
        )?;
        registry.register(Box::new(entries_committed_total.clone()))?;

        let compressed_payloads_total = IntCounter::new(
            "compressed_payloads_total",
            "Committed payloads that required gzip",
        )?;
        registry.register(Box::new(compressed_payloads_total.clone()))?;

        let payload_bytes = Histogram::with_opts(
            HistogramOpts::new("payload_bytes", "Encoded payload size of committed links")
                .buckets(vec![64.0, 256.0, 512.0, 1024.0, 2048.0, 3072.0, 4096.0]),
        )?;
        registry.register(Box::new(payload_bytes.clone()))?;

        let commit_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "commit_duration_seconds",
                "Wall time of a commit attempt in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(commit_duration_seconds.clone()))?;

        let links_walked_total = IntCounter::new(
            "links_walked_total",
            "Transactions visited by history reads",
        )?;
        registry.register(Box::new(links_walked_total.clone()))?;

        let raw_payloads_total = IntCounter::new(
            "raw_payloads_total",
            "History payloads returned undecoded",
        )?;
        registry.register(Box::new(raw_payloads_total.clone()))?;

        Ok(Self {
            registry,
            commits_total,
            commit_failures_total,
            entries_committed_total,
            compressed_payloads_total,
            payload_bytes,
            commit_duration_seconds,
            links_walked_total,
            raw_payloads_total,
        })
    }

    /// Records a failed commit attempt.
    pub fn record_failure(&self, kind: &str) {
        self.commit_failures_total.with_label_values(&[kind]).inc();
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
