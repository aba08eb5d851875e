//! # Protocol Configuration & Constants
//!
//! Every magic number in AuditChain lives here. Fee and dust values mirror
//! what BSV miners accepted when the log format was designed; change them
//! and old chains still read fine, but new writes may be rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chain Layout
// ---------------------------------------------------------------------------

/// Version of the link layout and payload format below.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Reserved predecessor txid meaning "no prior transaction". Coinbase inputs
/// point here, and backward traversal stops when it sees it.
pub const ROOT_MARKER: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Output index of the data-carrier output in every chain link.
pub const DATA_OUTPUT_INDEX: u32 = 0;

/// Output index of the change output that becomes the next chain head.
pub const CHANGE_OUTPUT_INDEX: u32 = 1;

/// Transaction version written into every chain link.
pub const CHAIN_TX_VERSION: u32 = 1;

/// Input sequence number for chain links (final, no relative locktime).
pub const FINAL_SEQUENCE: u32 = 0xFFFF_FFFF;

// ---------------------------------------------------------------------------
// Fee Parameters
// ---------------------------------------------------------------------------

/// Flat fee per chain link, in satoshis. Low, but comfortably above the
/// minimum relay fee for a one-in/two-out transaction with a 4 KiB payload.
pub const DEFAULT_FEE_SATS: u64 = 300;

/// Smallest output value the network relays. A change output at or below
/// this is refused before it ever reaches the broadcaster.
pub const DUST_THRESHOLD_SATS: u64 = 546;

// ---------------------------------------------------------------------------
// Payload & Batching
// ---------------------------------------------------------------------------

/// Default ceiling on the encoded payload, compressed or not.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4 * 1024;

/// Default number of entries a session-mode buffer waits for before a
/// policy flush commits.
pub const DEFAULT_MIN_BATCH_SIZE: usize = 1;

/// Agent identifier used when the caller doesn't configure one.
pub const DEFAULT_AGENT_ID: &str = "default-agent";

// ---------------------------------------------------------------------------
// Timing & Bounds
// ---------------------------------------------------------------------------

/// Upper bound on every network round-trip (UTXO query, tx fetch, broadcast).
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum number of links the reader will walk before declaring the chain
/// malformed. A log that genuinely exceeds this needs `history_from`
/// checkpoints, not a bigger number.
pub const MAX_TRAVERSAL_DEPTH: usize = 10_000;

/// How long a staging writer waits for the staging lock before giving up.
pub const STAGING_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// A staging lock file older than this is assumed to belong to a crashed
/// process and is removed.
pub const STAGING_LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Collaborator Endpoints
// ---------------------------------------------------------------------------

/// WhatsOnChain mainnet API base.
pub const WOC_API_MAINNET: &str = "https://api.whatsonchain.com/v1/bsv/main";

/// WhatsOnChain testnet API base.
pub const WOC_API_TESTNET: &str = "https://api.whatsonchain.com/v1/bsv/test";

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// When a policy flush actually writes to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Every flush call with pending entries commits a link.
    Immediate,
    /// Entries accumulate until `min_batch_size` is reached or the flush is
    /// forced (typically at the end of an agent session).
    Session,
}

/// Where pending entries live between flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingMode {
    /// Process memory only. A crash loses the pending batch.
    Memory,
    /// A staging document on disk, rewritten on every append.
    Durable,
}

/// Tunable parameters for an audit session.
///
/// Every field has a default, so a config file only needs to mention what it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Flush policy.
    pub mode: FlushMode,
    /// Entries required before a session-mode policy flush commits.
    pub min_batch_size: usize,
    /// Ceiling on the encoded payload size in bytes.
    pub max_payload_bytes: usize,
    /// Memory or durable staging.
    pub staging_mode: StagingMode,
    /// Identifier embedded in every batch.
    pub agent_id: String,
    /// Flat fee per link, in satoshis.
    pub fee_sats: u64,
    /// Dust threshold for the change output, in satoshis.
    pub dust_threshold_sats: u64,
    /// Timeout applied to each network call, in milliseconds.
    pub network_timeout_ms: u64,
    /// Traversal bound for history reads.
    pub max_traversal_depth: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            mode: FlushMode::Session,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            staging_mode: StagingMode::Memory,
            agent_id: DEFAULT_AGENT_ID.to_string(),
            fee_sats: DEFAULT_FEE_SATS,
            dust_threshold_sats: DUST_THRESHOLD_SATS,
            network_timeout_ms: NETWORK_TIMEOUT.as_millis() as u64,
            max_traversal_depth: MAX_TRAVERSAL_DEPTH,
        }
    }
}

impl AuditConfig {
    /// The per-call network timeout as a `Duration`.
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Smallest head value that can still produce a valid link:
    /// `fee + dust + 1`.
    pub fn min_head_value(&self) -> u64 {
        self.fee_sats
            .saturating_add(self.dust_threshold_sats)
            .saturating_add(1)
    }

    /// Rejects configurations that could never commit anything.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_batch_size == 0 {
            return Err("min_batch_size must be at least 1".to_string());
        }
        if self.max_payload_bytes == 0 {
            return Err("max_payload_bytes must be positive".to_string());
        }
        if self.network_timeout_ms == 0 {
            return Err("network_timeout_ms must be positive".to_string());
        }
        if self.max_traversal_depth == 0 {
            return Err("max_traversal_depth must be at least 1".to_string());
        }
        if self.agent_id.trim().is_empty() {
            return Err("agent_id must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_marker_is_64_zero_hex_digits() {
        assert_eq!(ROOT_MARKER.len(), 64);
        assert!(ROOT_MARKER.chars().all(|c| c == '0'));
    }

    #[test]
    fn test_output_indices_are_distinct() {
        assert_ne!(DATA_OUTPUT_INDEX, CHANGE_OUTPUT_INDEX);
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AuditConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.mode, FlushMode::Session);
        assert_eq!(cfg.staging_mode, StagingMode::Memory);
        assert_eq!(cfg.network_timeout(), NETWORK_TIMEOUT);
    }

    #[test]
    fn test_min_head_value_is_fee_plus_dust_plus_one() {
        let cfg = AuditConfig::default();
        assert_eq!(cfg.min_head_value(), DEFAULT_FEE_SATS + DUST_THRESHOLD_SATS + 1);
    }

    #[test]
    fn test_partial_config_json_uses_defaults() {
        let cfg: AuditConfig =
            serde_json::from_str(r#"{"mode": "immediate", "staging_mode": "durable"}"#).unwrap();
        assert_eq!(cfg.mode, FlushMode::Immediate);
        assert_eq!(cfg.staging_mode, StagingMode::Durable);
        assert_eq!(cfg.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
        assert_eq!(cfg.agent_id, DEFAULT_AGENT_ID);
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        let mut cfg = AuditConfig::default();
        cfg.min_batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AuditConfig::default();
        cfg.agent_id = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = AuditConfig::default();
        cfg.max_traversal_depth = 0;
        assert!(cfg.validate().is_err());
    }
}
