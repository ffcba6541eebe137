//! The persisted shape of one transfer in the off-ledger index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transfer::{Address, Amount, Commitment, Salt, Token, TransferId, TransferStatus};

/// Everything the index knows about a transfer.
///
/// This is the only place the recipient is ever associated with an
/// identifier. Losing it orphans the escrow: the ledger still holds the
/// funds, but nobody except the original pair can say who they are for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub identifier: TransferId,
    pub sender: Address,
    pub recipient: Address,
    pub token: Token,
    /// Gross amount the sender asked to send, before the publish fee.
    pub amount: Amount,
    pub salt: Salt,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    /// When the claim or cancel executed. `None` while pending.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Address whose ledger transaction resolved the transfer.
    pub resolved_by: Option<Address>,
    /// When the publish was observed on the ledger.
    pub published_at: Option<DateTime<Utc>>,
    /// Net amount the ledger escrowed, once observed.
    pub escrowed_amount: Option<Amount>,
    /// The ledger claim came from someone other than `recipient`.
    pub claimer_mismatch: bool,
}

impl IndexRecord {
    /// A fresh pending record.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        identifier: TransferId,
        sender: Address,
        recipient: Address,
        amount: Amount,
        token: Token,
        salt: Salt,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identifier,
            sender,
            recipient,
            token,
            amount,
            salt,
            status: TransferStatus::Pending,
            created_at,
            resolved_at: None,
            resolved_by: None,
            published_at: None,
            escrowed_amount: None,
            claimer_mismatch: false,
        }
    }

    /// Whether the ledger publish has been observed.
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

impl From<&Commitment> for IndexRecord {
    fn from(c: &Commitment) -> Self {
        IndexRecord::pending(
            c.identifier,
            c.sender,
            c.recipient,
            c.amount,
            c.token.clone(),
            c.salt.clone(),
            c.created_at,
        )
    }
}

/// Which way the ledger resolved a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Claimed,
    Cancelled,
}

impl Resolution {
    /// The terminal status this resolution leads to.
    pub fn status(&self) -> TransferStatus {
        match self {
            Resolution::Claimed => TransferStatus::Claimed,
            Resolution::Cancelled => TransferStatus::Cancelled,
        }
    }
}

/// Whether a write changed the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record moved to the requested state.
    Applied,
    /// The record was already in the requested state; nothing written.
    Unchanged,
}

/// A status overwrite performed while re-deriving state from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub identifier: TransferId,
    pub previous_status: TransferStatus,
    pub previous_actor: Option<Address>,
    pub status: TransferStatus,
    pub actor: Address,
}

/// Aggregate counts across the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total: u64,
    pub pending: u64,
    pub claimed: u64,
    pub cancelled: u64,
}

/// Per-address activity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressStats {
    /// Transfers this address created as sender.
    pub total_sent: u64,
    /// Transfers this address received and that were claimed.
    pub total_received: u64,
    /// Transfers still waiting for this address to claim.
    pub pending_incoming: u64,
}
