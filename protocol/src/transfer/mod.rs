//! # Transfer Module
//!
//! The vocabulary of a hidden transfer and the generator that commits to
//! one.
//!
//! ```text
//! types.rs     : Address, Token/TokenRegistry, TransferId, Salt, TransferStatus
//! commitment.rs: salted SHA-256 commitment: create, recompute, verify
//! ```

pub mod commitment;
pub mod types;

pub use commitment::{Commitment, CommitmentError, CommitmentGenerator};
pub use types::{
    Address, Amount, ParseError, Salt, Token, TokenRegistry, TransferId, TransferStatus,
};
