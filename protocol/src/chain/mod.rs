//! # Chain Module
//!
//! Everything that talks to the ledger: picking the head, extending the
//! chain by one link, and walking it back.
//!
//! ```text
//! head.rs      - chain heads, UTXOs, head selection
//! services.rs  - collaborator traits (keys, UTXOs, fetch, broadcast)
//! writer.rs    - the commit state machine and per-address locks
//! reader.rs    - backward history traversal
//! memory.rs    - in-process ledger and key service
//! ```

pub mod head;
pub mod memory;
pub mod reader;
pub mod services;
pub mod writer;

pub use head::{select_head, ChainHead, Utxo};
pub use memory::{InMemoryLedger, StaticKeyService};
pub use reader::{ChainReader, ChainRecord};
pub use services::{Broadcaster, ChainServices, KeyService, TxFetch, UtxoQuery};
pub use writer::{AddressRegistry, ChainWriter, CommitReceipt, WriterState};
