//! # Ledger Interface
//!
//! The types the off-ledger side uses to talk about the escrow contract, and
//! the [`LedgerClient`] seam through which the coordinator reaches it.
//!
//! The contract itself lives in `cloak-contracts`; this module only fixes the
//! shapes that cross the boundary:
//!
//! - [`LedgerCall`]: a prepared `publish` / `claim` / `cancel`, ready for a
//!   signer.
//! - [`EscrowRecord`]: the ledger's view of one identifier. Note the absence
//!   of a recipient field: the ledger never learns who a transfer is for.
//! - [`LedgerEvent`]: one entry of the contract's ordered, replayable event
//!   log. Reconciliation consumes these by sequence number.
//!
//! Signing and broadcasting are somebody else's job. A client either
//! confirms (returns the event the call produced) or fails with a
//! [`ClientError`] that says whether trying again could ever help.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transfer::{Address, Amount, Token, TransferId};

/// A contract call prepared for a signing client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerCall {
    /// Escrow `amount` of `token` under `identifier`.
    Publish {
        identifier: TransferId,
        token: Token,
        amount: Amount,
    },
    /// Take the escrowed funds for `identifier`.
    Claim { identifier: TransferId },
    /// Return an expired, unclaimed escrow to its sender.
    Cancel { identifier: TransferId },
}

impl LedgerCall {
    /// The identifier the call operates on.
    pub fn identifier(&self) -> &TransferId {
        match self {
            LedgerCall::Publish { identifier, .. }
            | LedgerCall::Claim { identifier }
            | LedgerCall::Cancel { identifier } => identifier,
        }
    }
}

/// The ledger's record for one escrowed identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// The address that published (and may cancel) the escrow.
    pub sender: Address,
    /// Escrowed asset.
    pub token: Token,
    /// Amount held, after the publish fee.
    pub amount: Amount,
    /// Ledger time of publication, in seconds.
    pub created_at: u64,
    /// Set once by either claim or cancel. Never cleared.
    pub claimed: bool,
}

/// One entry in the contract's append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Position in the log, starting at 1. Strictly increasing.
    pub seq: u64,
    /// Ledger time at which the emitting transaction executed.
    pub block_time: u64,
    /// What happened.
    pub kind: LedgerEventKind,
}

impl LedgerEvent {
    /// The transfer this event concerns, if any. Administrative events
    /// return `None`.
    pub fn identifier(&self) -> Option<&TransferId> {
        match &self.kind {
            LedgerEventKind::Published { identifier, .. }
            | LedgerEventKind::Claimed { identifier, .. }
            | LedgerEventKind::Cancelled { identifier, .. } => Some(identifier),
            _ => None,
        }
    }
}

/// Payload of a [`LedgerEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    Published {
        identifier: TransferId,
        sender: Address,
        token: Token,
        net_amount: Amount,
        fee: Amount,
    },
    Claimed {
        identifier: TransferId,
        claimer: Address,
        amount: Amount,
    },
    Cancelled {
        identifier: TransferId,
        sender: Address,
        amount: Amount,
    },
    FeeRateUpdated {
        fee_bps: u32,
    },
    FeeCollectorUpdated {
        collector: Address,
    },
    AssetsRecovered {
        token: Token,
        amount: Amount,
        to: Address,
    },
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Failures reported by a signing / broadcast client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The signer refused to sign. Permanent.
    #[error("rejected by signer: {0}")]
    Rejected(String),

    /// The ledger executed the call and refused it (already exists, already
    /// claimed, too early, ...). Permanent: resubmitting would fail again.
    #[error("reverted by ledger: {0}")]
    Reverted(String),

    /// No confirmation arrived in time. The call may still have landed.
    #[error("timed out waiting for ledger confirmation")]
    Timeout,

    /// The ledger endpoint could not be reached.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl ClientError {
    /// `true` for failures that say nothing about ledger state, so an
    /// idempotent operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Timeout | ClientError::Unavailable(_))
    }
}

/// Opaque, asynchronous access to the ledger.
///
/// `submit` signs as `caller` and waits for execution. Reads (`escrow`,
/// `events_since`) are idempotent and safe to retry.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Signs and submits `call`, returning the event it produced.
    async fn submit(&self, caller: &Address, call: LedgerCall) -> Result<LedgerEvent, ClientError>;

    /// Reads the escrow record for `identifier`, `None` if unpublished.
    async fn escrow(&self, identifier: &TransferId) -> Result<Option<EscrowRecord>, ClientError>;

    /// Returns up to `limit` events with `seq > cursor`, in order.
    async fn events_since(&self, cursor: u64, limit: usize) -> Result<Vec<LedgerEvent>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TokenRegistry;

    fn id(byte: u8) -> TransferId {
        TransferId::from_bytes([byte; 32])
    }

    #[test]
    fn event_identifier_covers_transfer_events_only() {
        let addr = Address::from_bytes([1; 20]);
        let claimed = LedgerEvent {
            seq: 1,
            block_time: 10,
            kind: LedgerEventKind::Claimed {
                identifier: id(9),
                claimer: addr,
                amount: 5,
            },
        };
        assert_eq!(claimed.identifier(), Some(&id(9)));

        let admin = LedgerEvent {
            seq: 2,
            block_time: 11,
            kind: LedgerEventKind::FeeRateUpdated { fee_bps: 10 },
        };
        assert_eq!(admin.identifier(), None);
    }

    #[test]
    fn ledger_call_wire_format() {
        let token = TokenRegistry::default().resolve("USDC").unwrap();
        let call = LedgerCall::Publish {
            identifier: id(1),
            token,
            amount: 100,
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["publish"]["token"], "USDC");
        assert_eq!(json["publish"]["amount"], 100);
        assert_eq!(call.identifier(), &id(1));

        let back: LedgerCall = serde_json::from_value(json).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn transient_classification() {
        assert!(ClientError::Timeout.is_transient());
        assert!(ClientError::Unavailable("conn reset".into()).is_transient());
        assert!(!ClientError::Rejected("user declined".into()).is_transient());
        assert!(!ClientError::Reverted("AlreadyExists".into()).is_transient());
    }
}
