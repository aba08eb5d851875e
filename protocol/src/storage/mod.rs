//! # Storage Module
//!
//! Local persistence. Nothing here is authoritative: the chain is. These
//! stores only exist so a write can skip a network round trip and so a
//! crash between `log` and `flush` loses nothing.
//!
//! ## Architecture
//!
//! ```text
//! cache.rs    - per-address chain head cache (sled)
//! staging.rs  - staged pending entries (memory, or JSON file + lock file)
//! ```
//!
//! ## Design Decisions
//!
//! 1. **sled for the head cache.** One small tree, keyed by address,
//!    flushed on every write. Embedded, no server, survives restarts.
//!
//! 2. **Whole-document staging.** The staged sequence is rewritten in full
//!    on every change, never appended to. A torn write can only ever leave
//!    the previous document or the next one, thanks to temp file + rename.
//!
//! 3. **Bincode on disk, JSON where humans look.** Cache records are
//!    bincode; the staging document is JSON because operators inspect it
//!    after a crash.

pub mod cache;
pub mod staging;

pub use cache::{DbError, HeadCache};
pub use staging::{FileStaging, MemoryStaging, StagingError, StagingStore};
