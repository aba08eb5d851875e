//! The batch buffer.
//!
//! Holds entries between `log` and a successful commit. Every mutation goes
//! through the [`StagingStore`] first, so the in-memory view is always a
//! copy of what is staged and never the other way round.
//!
//! The staged document is authoritative. An entry is acknowledged only once
//! it is staged, so the buffer never holds anything staging lacks; when the
//! two disagree it is because another process sharing the store committed
//! and unstaged entries, and the buffer follows. [`BatchBuffer::reload`] is
//! therefore idempotent, and a crash can only leave staged work behind,
//! never lose it.

use std::sync::Arc;

use crate::batch::LogEntry;
use crate::config::FlushMode;
use crate::storage::staging::{MemoryStaging, StagingError, StagingStore};

/// Pending log entries, mirrored into a staging store.
pub struct BatchBuffer {
    entries: Vec<LogEntry>,
    staging: Arc<dyn StagingStore>,
}

impl std::fmt::Debug for BatchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("entries", &self.entries.len())
            .field("staging", &self.staging.describe())
            .finish()
    }
}

impl BatchBuffer {
    /// An empty buffer over `staging`. Call [`reload`](Self::reload) to pick
    /// up whatever a previous run left behind.
    pub fn new(staging: Arc<dyn StagingStore>) -> Self {
        Self {
            entries: Vec::new(),
            staging,
        }
    }

    /// An empty buffer with process-local staging.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStaging::new()))
    }

    /// Stages `entry`, then adopts the staged document as the buffer, which
    /// also picks up whatever other writers staged in the meantime.
    pub fn append(&mut self, entry: LogEntry) -> Result<(), StagingError> {
        let staged = self.staging.update(&mut |staged| staged.push(entry.clone()))?;
        self.entries = staged;
        Ok(())
    }

    /// Replaces the buffer with the staged document. Returns how many
    /// staged entries the buffer did not already hold.
    ///
    /// Entries held in memory but no longer staged were committed by another
    /// writer sharing the store, and are dropped.
    pub fn reload(&mut self) -> Result<usize, StagingError> {
        let staged = self.staging.load()?;
        let recovered = count_missing(&staged, &self.entries);
        let dropped = count_missing(&self.entries, &staged);
        if dropped > 0 {
            tracing::debug!(dropped, "entries unstaged elsewhere");
        }
        self.entries = staged;
        if recovered > 0 {
            tracing::info!(
                recovered,
                staging = %self.staging.describe(),
                "recovered staged entries"
            );
        }
        Ok(recovered)
    }

    /// Removes exactly `committed` from the buffer and from staging.
    ///
    /// Entries another process staged after the snapshot was taken are
    /// left in place.
    pub fn clear_committed(&mut self, committed: &[LogEntry]) -> Result<(), StagingError> {
        self.entries = self.staging.update(&mut |staged| remove_each(staged, committed))?;
        Ok(())
    }

    /// Empties the buffer and the staged document.
    pub fn clear(&mut self) -> Result<(), StagingError> {
        self.staging.update(&mut |staged| staged.clear())?;
        self.entries.clear();
        Ok(())
    }

    /// Pending entries, oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a flush under `mode` should commit now.
    ///
    /// An empty buffer never commits. `force` overrides the session
    /// threshold.
    pub fn ready(&self, mode: FlushMode, min_batch_size: usize, force: bool) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        match mode {
            FlushMode::Immediate => true,
            FlushMode::Session => force || self.entries.len() >= min_batch_size,
        }
    }
}

/// How many entries of `of` are not matched, one for one, in `against`.
fn count_missing(of: &[LogEntry], against: &[LogEntry]) -> usize {
    let mut unmatched: Vec<&LogEntry> = against.iter().collect();
    let mut missing = 0;
    for entry in of {
        match unmatched.iter().position(|e| *e == entry) {
            Some(pos) => {
                unmatched.swap_remove(pos);
            }
            None => missing += 1,
        }
    }
    missing
}

/// Removes one occurrence of each entry in `committed`.
fn remove_each(from: &mut Vec<LogEntry>, committed: &[LogEntry]) {
    for entry in committed {
        if let Some(pos) = from.iter().position(|e| e == entry) {
            from.remove(pos);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
