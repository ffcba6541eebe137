//! # Cloak Contracts
//!
//! The ledger side of a hidden transfer.
//!
//! - **Hidden Escrow**: funds held under opaque identifiers with
//!   publish / claim / cancel transitions, a capped publish fee, and an
//!   ordered event log.
//! - **Clock**: where block time comes from.
//! - **Client**: an in-process `LedgerClient` so the settlement coordinator
//!   can drive the contract without a chain.
//!
//! ## Design Principles
//!
//! 1. All monetary operations are checked: `checked_add`, `checked_sub`,
//!    `checked_mul`. A refused call changes nothing.
//! 2. Callers and time are explicit parameters. The contract reads no
//!    globals.
//! 3. The ledger never stores a recipient.

pub mod client;
pub mod clock;
pub mod hidden_escrow;

pub use client::InProcessLedger;
pub use clock::{LedgerClock, ManualClock, SystemClock};
pub use hidden_escrow::{EscrowError, EscrowLedger, FeeConfig, LedgerStats};
