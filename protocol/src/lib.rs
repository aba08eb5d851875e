// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # AuditChain Protocol: Core Library
//!
//! A tamper-evident audit log for autonomous agents, kept on a UTXO ledger.
//! Every flush becomes one transaction that spends the previous one's change
//! output, so the log is a single chain of links: rewriting an entry means
//! rewriting every link after it, in public.
//!
//! ## Architecture
//!
//! - **logger**: The session façade: `log`, `flush`, `history`.
//! - **buffer**: Pending entries, mirrored into staging so crashes lose nothing.
//! - **codec**: Batch ⇄ payload bytes (JSON, gzip when it won't fit).
//! - **chain**: Head selection, the commit state machine, history traversal.
//! - **transaction**: Wire format, data-carrier scripts, link building, signing hand-off.
//! - **storage**: sled head cache and staging stores.
//! - **client**: WhatsOnChain HTTP collaborators.
//! - **crypto**: SHA-256 and txid helpers.
//! - **metrics**: Prometheus counters for commits and reads.
//! - **config**: Protocol constants and session configuration.
//!
//! ## Design Philosophy
//!
//! 1. The chain is the source of truth. Local state is a hint.
//! 2. A flush commits everything it took or nothing at all.
//! 3. Keys never enter this crate. Signing is delegated.
//! 4. History reads fail loudly rather than return a shortened chain.

pub mod batch;
pub mod buffer;
pub mod chain;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod storage;
pub mod transaction;

pub use batch::{Batch, LogEntry};
pub use error::{AuditError, AuditResult};
pub use logger::{AuditLogger, FlushOutcome};
