//! Network-backed collaborators.

pub mod woc;

pub use woc::{Network, WhatsOnChainClient};
