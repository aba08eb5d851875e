//! # Transaction Module
//!
//! Construction, serialization, and signing hand-off for chain link
//! transactions.
//!
//! ## Architecture
//!
//! ```text
//! types.rs    - Wire format: OutPoint, TxInput, TxOutput, Transaction, txid
//! script.rs   - Data-carrier (OP_RETURN) scripts and push-data encoding
//! builder.rs  - ChainLinkBuilder: head + payload → unsigned link, fee/dust rules
//! signing.rs  - SigningContext handed to the key service, proof attachment
//! ```
//!
//! ## Link Lifecycle
//!
//! 1. **Build**: [`ChainLinkBuilder`] spends the head, adds the carrier and
//!    change outputs.
//! 2. **Sign**: the key service turns a [`SigningContext`] into an
//!    [`UnlockingProof`].
//! 3. **Serialize**: [`Transaction::to_bytes`] produces the raw bytes the
//!    broadcaster submits; [`Transaction::txid`] names the next head.
//!
//! ## Design Decisions
//!
//! - Txids are carried as display-order hex strings everywhere; only the
//!   wire codec flips byte order.
//! - All amounts are `u64` satoshis. Fee arithmetic is checked before any
//!   subtraction happens.

pub mod builder;
pub mod script;
pub mod signing;
pub mod types;

pub use builder::{ChainLinkBuilder, UnsignedLink};
pub use script::ScriptError;
pub use signing::{apply_unlocking_proof, SignRequest, SigningContext, UnlockingProof};
pub use types::{txid_of_raw, OutPoint, Transaction, TxDecodeError, TxInput, TxOutput};
