use thiserror::Error;

use crate::ledger::ClientError;
use crate::storage::IndexError;
use crate::transfer::{Address, CommitmentError, TransferId, TransferStatus};

/// How a caller should react to a [`SettlementError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. Never retried.
    Validation,
    /// The request contradicts current state. Never retried.
    Conflict,
    /// Something was unreachable or slow. Safe to retry idempotent requests.
    Availability,
    /// The index and ledger disagree. Corrected from the ledger's event
    /// stream.
    Consistency,
}

/// Errors surfaced by the settlement coordinator.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Commitment(#[from] CommitmentError),

    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("wrong claimer for {identifier}: expected {expected}, got {got}")]
    WrongClaimer {
        identifier: TransferId,
        expected: Address,
        got: Address,
    },

    #[error("wrong canceller for {identifier}: expected {expected}, got {got}")]
    WrongCanceller {
        identifier: TransferId,
        expected: Address,
        got: Address,
    },

    #[error("duplicate identifier: {0}")]
    DuplicateIdentifier(TransferId),

    #[error("transfer {identifier} already resolved as {status}")]
    AlreadyResolved {
        identifier: TransferId,
        status: TransferStatus,
    },

    #[error("a publish for {0} is already in flight")]
    PublishInFlight(TransferId),

    #[error("transfer {0} is not settled on the ledger")]
    NotSettledOnLedger(TransferId),

    #[error("publish for {0} was not confirmed; the record stays pending")]
    PublishUnconfirmed(TransferId),

    #[error("ledger refused {identifier}: {source}")]
    LedgerRefused {
        identifier: TransferId,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Ledger(ClientError),

    #[error("transfer {0} has a confirmed escrow")]
    EscrowConfirmed(TransferId),

    #[error("index storage error: {0}")]
    Storage(String),

    #[error("index and ledger disagree: {0}")]
    Inconsistent(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// Classifies the error for retry and HTTP mapping decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            SettlementError::Commitment(_)
            | SettlementError::NotFound(_)
            | SettlementError::WrongClaimer { .. }
            | SettlementError::WrongCanceller { .. } => ErrorClass::Validation,

            SettlementError::DuplicateIdentifier(_)
            | SettlementError::AlreadyResolved { .. }
            | SettlementError::PublishInFlight(_)
            | SettlementError::NotSettledOnLedger(_)
            | SettlementError::EscrowConfirmed(_)
            | SettlementError::LedgerRefused { .. } => ErrorClass::Conflict,

            SettlementError::Ledger(e) if e.is_transient() => ErrorClass::Availability,
            SettlementError::Ledger(_) => ErrorClass::Conflict,

            SettlementError::PublishUnconfirmed(_)
            | SettlementError::Storage(_)
            | SettlementError::Internal(_) => ErrorClass::Availability,

            SettlementError::Inconsistent(_) => ErrorClass::Consistency,
        }
    }

    /// Shorthand for `class() == ErrorClass::Availability`.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Availability
    }
}

impl From<IndexError> for SettlementError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound(id) => SettlementError::NotFound(id),
            IndexError::DuplicateIdentifier(id) => SettlementError::DuplicateIdentifier(id),
            IndexError::WrongClaimer {
                identifier,
                expected,
                got,
            } => SettlementError::WrongClaimer {
                identifier,
                expected,
                got,
            },
            IndexError::WrongCanceller {
                identifier,
                expected,
                got,
            } => SettlementError::WrongCanceller {
                identifier,
                expected,
                got,
            },
            IndexError::AlreadyResolved { identifier, status } => {
                SettlementError::AlreadyResolved { identifier, status }
            }
            IndexError::EscrowConfirmed(id) => SettlementError::EscrowConfirmed(id),
            IndexError::Sled(e) => SettlementError::Storage(e.to_string()),
            IndexError::Serialization(msg) => SettlementError::Storage(msg),
        }
    }
}

impl From<ClientError> for SettlementError {
    fn from(err: ClientError) -> Self {
        SettlementError::Ledger(err)
    }
}
