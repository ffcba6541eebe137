//! # Storage Module
//!
//! The off-ledger index: the only place a transfer identifier is linked to
//! its recipient.
//!
//! ## Architecture
//!
//! ```text
//! record.rs: IndexRecord and the small value types the index returns
//! index.rs : TransferIndex: sled trees, transactional status writes
//! ```
//!
//! ## Design Decisions
//!
//! 1. **sled, not a server database.** The index is embedded in the node
//!    process. Multi-tree transactions give us per-identifier serialization
//!    without a lock table of our own.
//!
//! 2. **Bincode for on-disk records.** Compact and deterministic. JSON is for
//!    the HTTP surface.
//!
//! 3. **A secondary tree for the hot query.** "What is waiting for me?" is a
//!    prefix scan over `pending_by_recipient`, never a full table walk.

pub mod index;
pub mod record;

pub use index::{IndexError, IndexResult, TransferIndex};
pub use record::{AddressStats, Correction, IndexRecord, IndexStats, Resolution, Transition};
