//! Applying ledger events to the index.
//!
//! The ledger is authoritative for custody; the index is authoritative for
//! who a transfer was meant for. Reconciliation folds the ledger's event
//! stream into the index, one identifier partition at a time, and records
//! every place the two disagreed.
//!
//! Every step here is idempotent. Replaying an event that was already
//! applied leaves the record untouched, which is what makes it safe to
//! persist the cursor only after a whole batch has landed.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::ledger::{LedgerEvent, LedgerEventKind};
use crate::storage::{IndexError, Resolution, TransferIndex, Transition};
use crate::transfer::{Address, TransferId};

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Ledger events read, administrative ones included.
    pub events: u64,
    /// Events that changed an index record.
    pub applied: u64,
    /// Events the index already reflected.
    pub unchanged: u64,
    /// Records overwritten because the index had reached a state the ledger
    /// contradicts.
    pub corrections: u64,
    /// Claims executed by an address other than the recorded recipient.
    pub mismatches: u64,
    /// Transfer events for identifiers the index has never seen.
    pub unknown: u64,
    /// Cursor after the pass.
    pub cursor: u64,
}

impl ReconcileReport {
    pub(crate) fn absorb(&mut self, other: &PartitionOutcome) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.corrections += other.corrections;
        self.mismatches += other.mismatches;
        self.unknown += other.unknown;
    }
}

/// Counters for one partition of a batch.
#[derive(Debug, Default)]
pub(crate) struct PartitionOutcome {
    applied: u64,
    unchanged: u64,
    corrections: u64,
    mismatches: u64,
    unknown: u64,
}

/// Converts ledger seconds to a timestamp.
pub(crate) fn ledger_time(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Picks the partition an identifier belongs to. All events for one
/// identifier land in the same partition, so their ledger order survives.
pub(crate) fn partition_of(identifier: &TransferId, partitions: usize) -> usize {
    let bytes = identifier.as_bytes();
    let head = u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);
    (head % partitions.max(1) as u64) as usize
}

/// Applies one partition's events, in order.
pub(crate) fn apply_partition(
    index: &TransferIndex,
    events: &[LedgerEvent],
) -> Result<PartitionOutcome, IndexError> {
    let mut outcome = PartitionOutcome::default();
    for event in events {
        apply_event(index, event, &mut outcome)?;
    }
    Ok(outcome)
}

fn apply_event(
    index: &TransferIndex,
    event: &LedgerEvent,
    outcome: &mut PartitionOutcome,
) -> Result<(), IndexError> {
    let at = ledger_time(event.block_time);
    match &event.kind {
        LedgerEventKind::Published {
            identifier,
            net_amount,
            ..
        } => match index.mark_published(identifier, *net_amount, at) {
            Ok(t) => count(outcome, t),
            Err(IndexError::NotFound(_)) => unknown(outcome, event, identifier),
            Err(e) => return Err(e),
        },

        LedgerEventKind::Claimed {
            identifier,
            claimer,
            ..
        } => match index.mark_claimed(identifier, claimer, at) {
            Ok(t) => count(outcome, t),
            Err(IndexError::NotFound(_)) => unknown(outcome, event, identifier),
            Err(IndexError::WrongClaimer { expected, .. }) => {
                // The ledger pays whoever holds the identifier. Record what
                // actually happened and flag it.
                match index.apply_ledger_resolution(identifier, Resolution::Claimed, claimer, at)? {
                    Some(_) => {
                        outcome.mismatches += 1;
                        warn!(
                            identifier = %identifier,
                            recipient = %expected,
                            claimer = %claimer,
                            seq = event.seq,
                            "ledger claim executed by an address other than the recipient"
                        );
                    }
                    None => outcome.unchanged += 1,
                }
            }
            Err(IndexError::AlreadyResolved { .. }) => {
                correct(index, outcome, event, identifier, Resolution::Claimed, claimer, at)?
            }
            Err(e) => return Err(e),
        },

        LedgerEventKind::Cancelled {
            identifier, sender, ..
        } => match index.mark_cancelled(identifier, sender, at) {
            Ok(t) => count(outcome, t),
            Err(IndexError::NotFound(_)) => unknown(outcome, event, identifier),
            Err(IndexError::AlreadyResolved { .. }) | Err(IndexError::WrongCanceller { .. }) => {
                correct(index, outcome, event, identifier, Resolution::Cancelled, sender, at)?
            }
            Err(e) => return Err(e),
        },

        LedgerEventKind::FeeRateUpdated { .. }
        | LedgerEventKind::FeeCollectorUpdated { .. }
        | LedgerEventKind::AssetsRecovered { .. } => {
            debug!(seq = event.seq, "administrative ledger event");
        }
    }
    Ok(())
}

fn count(outcome: &mut PartitionOutcome, transition: Transition) {
    match transition {
        Transition::Applied => outcome.applied += 1,
        Transition::Unchanged => outcome.unchanged += 1,
    }
}

fn unknown(outcome: &mut PartitionOutcome, event: &LedgerEvent, identifier: &TransferId) {
    outcome.unknown += 1;
    debug!(
        identifier = %identifier,
        seq = event.seq,
        "ledger event for an identifier outside the index"
    );
}

fn correct(
    index: &TransferIndex,
    outcome: &mut PartitionOutcome,
    event: &LedgerEvent,
    identifier: &TransferId,
    resolution: Resolution,
    actor: &Address,
    at: DateTime<Utc>,
) -> Result<(), IndexError> {
    match index.apply_ledger_resolution(identifier, resolution, actor, at)? {
        Some(correction) => {
            outcome.corrections += 1;
            warn!(
                identifier = %identifier,
                seq = event.seq,
                previous = %correction.previous_status,
                status = %correction.status,
                actor = %actor,
                "index status corrected from ledger"
            );
        }
        None => outcome.unchanged += 1,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::IndexRecord;
    use crate::transfer::{Salt, TokenRegistry, TransferStatus};

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    fn seed(index: &TransferIndex, id: u8, sender: u8, recipient: u8) -> TransferId {
        let identifier = TransferId::from_bytes([id; 32]);
        let record = IndexRecord::pending(
            identifier,
            addr(sender),
            addr(recipient),
            1_000,
            TokenRegistry::default().resolve("ETH").unwrap(),
            Salt::from_bytes([id; 32]),
            ledger_time(100),
        );
        index.record_pending(&record).unwrap();
        identifier
    }

    fn event(seq: u64, kind: LedgerEventKind) -> LedgerEvent {
        LedgerEvent {
            seq,
            block_time: 1_000 + seq,
            kind,
        }
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        let id = TransferId::from_bytes([7; 32]);
        let p = partition_of(&id, 4);
        assert!(p < 4);
        assert_eq!(p, partition_of(&id, 4));
        assert_eq!(partition_of(&id, 0), 0);
    }

    #[test]
    fn claim_replay_is_idempotent() {
        let index = TransferIndex::open_temporary().unwrap();
        let id = seed(&index, 1, 0xa, 0xb);
        let events = vec![
            event(
                1,
                LedgerEventKind::Claimed {
                    identifier: id,
                    claimer: addr(0xb),
                    amount: 995,
                },
            ),
        ];

        let first = apply_partition(&index, &events).unwrap();
        assert_eq!(first.applied, 1);
        let second = apply_partition(&index, &events).unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(index.get_status(&id).unwrap(), TransferStatus::Claimed);
    }

    #[test]
    fn foreign_claimer_is_flagged() {
        let index = TransferIndex::open_temporary().unwrap();
        let id = seed(&index, 2, 0xa, 0xb);
        let events = vec![event(
            1,
            LedgerEventKind::Claimed {
                identifier: id,
                claimer: addr(0xc),
                amount: 995,
            },
        )];

        let outcome = apply_partition(&index, &events).unwrap();
        assert_eq!(outcome.mismatches, 1);
        let record = index.get(&id).unwrap().unwrap();
        assert_eq!(record.status, TransferStatus::Claimed);
        assert_eq!(record.resolved_by, Some(addr(0xc)));
        assert!(record.claimer_mismatch);

        // A replay sees the record already in the ledger's state.
        let again = apply_partition(&index, &events).unwrap();
        assert_eq!(again.mismatches, 0);
        assert_eq!(again.unchanged, 1);
        assert_eq!(index.get(&id).unwrap().unwrap().resolved_by, Some(addr(0xc)));
    }

    #[test]
    fn cancel_event_overrides_optimistic_claim() {
        let index = TransferIndex::open_temporary().unwrap();
        let id = seed(&index, 3, 0xa, 0xb);
        index.mark_claimed(&id, &addr(0xb), ledger_time(500)).unwrap();

        let events = vec![event(
            1,
            LedgerEventKind::Cancelled {
                identifier: id,
                sender: addr(0xa),
                amount: 995,
            },
        )];
        let outcome = apply_partition(&index, &events).unwrap();
        assert_eq!(outcome.corrections, 1);
        assert_eq!(index.get_status(&id).unwrap(), TransferStatus::Cancelled);
    }

    #[test]
    fn publish_and_unknown_events() {
        let index = TransferIndex::open_temporary().unwrap();
        let id = seed(&index, 4, 0xa, 0xb);
        let stranger = TransferId::from_bytes([0xee; 32]);
        let token = TokenRegistry::default().resolve("ETH").unwrap();
        let events = vec![
            event(
                1,
                LedgerEventKind::Published {
                    identifier: id,
                    sender: addr(0xa),
                    token: token.clone(),
                    net_amount: 995,
                    fee: 5,
                },
            ),
            event(
                2,
                LedgerEventKind::Published {
                    identifier: stranger,
                    sender: addr(0xd),
                    token,
                    net_amount: 10,
                    fee: 0,
                },
            ),
            event(3, LedgerEventKind::FeeRateUpdated { fee_bps: 10 }),
        ];
        let outcome = apply_partition(&index, &events).unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.unknown, 1);

        let record = index.get(&id).unwrap().unwrap();
        assert_eq!(record.escrowed_amount, Some(995));
        assert_eq!(record.published_at, Some(ledger_time(1_001)));
    }
}
