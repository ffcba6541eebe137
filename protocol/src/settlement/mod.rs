//! # Settlement Module
//!
//! The coordinator that runs the hidden-transfer protocol across the
//! generator, the index and the ledger, and the reconciliation that keeps
//! the index honest.
//!
//! ```text
//! coordinator.rs: SettlementCoordinator: prepare, publish, acknowledge, reconcile loop
//! reconcile.rs  : applying ledger events to the index, per identifier partition
//! retry.rs      : exponential backoff for idempotent ledger reads
//! error.rs      : SettlementError and its retry classes
//! ```

pub mod coordinator;
pub mod error;
pub mod reconcile;
pub mod retry;

pub use coordinator::{
    AuditFinding, AuditIssue, CoordinatorConfig, InitiatedTransfer, PreparedTransfer,
    PublishReceipt, SettlementCoordinator,
};
pub use error::{ErrorClass, SettlementError};
pub use reconcile::ReconcileReport;
pub use retry::RetryPolicy;
