//! # HeadCache: Local Chain-Head Persistence
//!
//! Remembers, per address, the change output the last successful write
//! produced, so the next write can skip the UTXO query. Built on sled's
//! embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree    | Key               | Value                |
//! |---------|-------------------|----------------------|
//! | `heads` | address (UTF-8)   | `bincode(HeadRecord)`|
//!
//! One record per address; a `put` replaces whatever was there. Each write
//! is flushed before returning so a crash right after a broadcast cannot
//! roll the cache back to an already-spent output.
//!
//! The cache is a hint, never the authority. The writer drops a record on
//! any ambiguous or rejected broadcast and falls back to network truth.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;

use crate::chain::head::ChainHead;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// HeadRecord
// ---------------------------------------------------------------------------

/// On-disk form of a cached head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadRecord {
    /// Address the head belongs to.
    pub address: String,
    /// Transaction holding the head output.
    pub txid: String,
    /// Output index.
    pub output_index: u32,
    /// Value in satoshis.
    pub value: u64,
}

impl HeadRecord {
    fn new(address: &str, head: &ChainHead) -> Self {
        Self {
            address: address.to_string(),
            txid: head.txid.clone(),
            output_index: head.output_index,
            value: head.value,
        }
    }

    fn into_head(self) -> ChainHead {
        ChainHead::new(self.txid, self.output_index, self.value)
    }
}

// ---------------------------------------------------------------------------
// HeadCache
// ---------------------------------------------------------------------------

/// Persistent per-address chain head cache.
///
/// # Thread Safety
///
/// sled trees support concurrent access, so `HeadCache` can be cloned and
/// shared between tasks without extra locking. Serializing writers for the
/// same address is the writer's job, not the cache's.
#[derive(Debug, Clone)]
pub struct HeadCache {
    db: Db,
    heads: Tree,
}

impl HeadCache {
    /// Open or create a cache at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a throwaway cache that is removed when dropped.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let heads = db.open_tree("heads")?;
        Ok(Self { db, heads })
    }

    /// Returns the cached head for `address`.
    ///
    /// `None` when nothing is cached, or when the stored record names a
    /// different address; either way the caller must ask the network.
    pub fn get(&self, address: &str) -> DbResult<Option<ChainHead>> {
        let Some(bytes) = self.heads.get(address.as_bytes())? else {
            return Ok(None);
        };
        let record: HeadRecord =
            bincode::deserialize(&bytes).map_err(|e| DbError::Serialization(e.to_string()))?;
        if record.address != address {
            tracing::warn!(
                requested = address,
                stored = %record.address,
                "cached head belongs to another address; ignoring"
            );
            return Ok(None);
        }
        Ok(Some(record.into_head()))
    }

    /// Persists `head` for `address`, replacing any prior record.
    pub fn put(&self, address: &str, head: &ChainHead) -> DbResult<()> {
        let bytes = bincode::serialize(&HeadRecord::new(address, head))
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        self.heads.insert(address.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Drops the record for `address`. Returns `true` if one existed.
    pub fn invalidate(&self, address: &str) -> DbResult<bool> {
        let removed = self.heads.remove(address.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(removed)
    }

    /// Number of addresses with a cached head.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// `true` if no heads are cached.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
