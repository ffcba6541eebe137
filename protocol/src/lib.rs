// Copyright (c) 2026 Cloak Contributors. MIT License.
// See LICENSE for details.

//! # Cloak Protocol: Core Library
//!
//! Hidden transfers: a sender escrows funds on a public ledger under an
//! opaque identifier, and only the off-ledger index knows who the identifier
//! is for. The recipient learns of it from the index and claims it on the
//! ledger.
//!
//! ## Architecture
//!
//! - **transfer**: Addresses, tokens, identifiers, and the salted SHA-256
//!   commitment that binds them.
//! - **storage**: The sled-backed off-ledger index. The only place a
//!   recipient is linked to an identifier.
//! - **ledger**: The shapes that cross into the escrow contract, and the
//!   `LedgerClient` trait the coordinator talks through.
//! - **settlement**: The coordinator: publish flow, claim acknowledgement,
//!   and reconciliation of ledger events into the index.
//! - **config**: Protocol constants and defaults.
//!
//! ## Consistency
//!
//! The ledger is the source of truth for custody. The index may run ahead
//! of it (a claim acknowledged before its event is read) or behind it (an
//! event not yet reconciled), but reconciliation always converges the index
//! onto the ledger's event stream. Privacy is limited to ledger observers
//! who cannot query the index.

pub mod config;
pub mod ledger;
pub mod settlement;
pub mod storage;
pub mod transfer;
