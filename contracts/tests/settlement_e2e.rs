//! End-to-end tests: settlement coordinator, on-disk index, and the escrow
//! contract behind the in-process ledger client.
//!
//! Each test stands alone with its own temporary index directory and ledger.

use std::sync::Arc;
use std::time::Duration;

use cloak_contracts::{EscrowLedger, InProcessLedger, ManualClock};
use cloak_protocol::config::CANCEL_WINDOW_SECS;
use cloak_protocol::ledger::{LedgerCall, LedgerClient};
use cloak_protocol::settlement::{
    CoordinatorConfig, RetryPolicy, SettlementCoordinator, SettlementError,
};
use cloak_protocol::storage::TransferIndex;
use cloak_protocol::transfer::{Address, Amount, CommitmentGenerator, TokenRegistry, TransferStatus};

const ONE: Amount = 1_000_000_000_000_000_000;
const T0: u64 = 1_700_000_000;

const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
const BOB: &str = "0x0000000000000000000000000000000000000b0b";
const EVE: &str = "0x0000000000000000000000000000000000000e0e";
const ADMIN: &str = "0x00000000000000000000000000000000000ad000";
const COLLECTOR: &str = "0x000000000000000000000000000000000000fee0";

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

struct Harness {
    coordinator: SettlementCoordinator<InProcessLedger>,
    ledger: InProcessLedger,
    clock: Arc<ManualClock>,
    _dir: tempfile::TempDir,
}

fn setup() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let index = TransferIndex::open(dir.path().join("index")).expect("index");

    let clock = Arc::new(ManualClock::new(T0));
    let escrow = EscrowLedger::new(addr(ADMIN), 50, addr(COLLECTOR)).unwrap();
    let ledger = InProcessLedger::new(escrow, clock.clone());
    let eth = TokenRegistry::default().resolve("ETH").unwrap();
    ledger.fund(&addr(ALICE), &eth, 1_000 * ONE).unwrap();

    let config = CoordinatorConfig {
        confirmation_timeout: Duration::from_secs(5),
        reconcile_batch: 3,
        reconcile_workers: 2,
        retry: RetryPolicy::none(),
    };
    let coordinator = SettlementCoordinator::new(
        CommitmentGenerator::default(),
        index,
        Arc::new(ledger.clone()),
        config,
    );
    Harness {
        coordinator,
        ledger,
        clock,
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_discover_claim_reconcile() {
    let h = setup();
    let sent = h
        .coordinator
        .initiate_transfer(ALICE, BOB, 100 * ONE, "ETH")
        .await
        .unwrap();
    let id = sent.transfer.identifier;
    assert_eq!(sent.receipt.escrowed_amount, 99 * ONE + ONE / 2);

    // Bob discovers the transfer through the index only.
    let pending = h.coordinator.list_pending_for(&addr(BOB)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].identifier, id);

    h.clock.advance(30);
    h.ledger
        .submit(&addr(BOB), LedgerCall::Claim { identifier: id })
        .await
        .unwrap();

    let report = h.coordinator.reconcile().await.unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.applied, 1);

    let record = h.coordinator.transfer_status(&id).unwrap();
    assert_eq!(record.status, TransferStatus::Claimed);
    assert_eq!(record.resolved_by, Some(addr(BOB)));
    assert!(!record.claimer_mismatch);
    assert!(h.coordinator.list_pending_for(&addr(BOB)).unwrap().is_empty());

    // A second claim fails on the ledger and moves nothing.
    let eth = TokenRegistry::default().resolve("ETH").unwrap();
    let before = h.ledger.read(|l| l.balance_of(&addr(BOB), &eth));
    assert!(h
        .ledger
        .submit(&addr(BOB), LedgerCall::Claim { identifier: id })
        .await
        .is_err());
    assert_eq!(h.ledger.read(|l| l.balance_of(&addr(BOB), &eth)), before);
}

#[tokio::test]
async fn claim_notification_then_reconcile_agree() {
    let h = setup();
    let id = h
        .coordinator
        .initiate_transfer(ALICE, BOB, ONE, "ETH")
        .await
        .unwrap()
        .transfer
        .identifier;

    assert!(matches!(
        h.coordinator.acknowledge_claim(&id, &addr(BOB)).await,
        Err(SettlementError::NotSettledOnLedger(_))
    ));

    h.ledger
        .submit(&addr(BOB), LedgerCall::Claim { identifier: id })
        .await
        .unwrap();
    h.coordinator.acknowledge_claim(&id, &addr(BOB)).await.unwrap();

    let report = h.coordinator.reconcile().await.unwrap();
    assert_eq!(report.corrections, 0);
    assert_eq!(report.mismatches, 0);
    assert_eq!(
        h.coordinator.index().get_status(&id).unwrap(),
        TransferStatus::Claimed
    );
}

#[tokio::test]
async fn intercepted_identifier_is_flagged() {
    let h = setup();
    let id = h
        .coordinator
        .initiate_transfer(ALICE, BOB, ONE, "ETH")
        .await
        .unwrap()
        .transfer
        .identifier;

    // Eve learns the identifier and claims first. The ledger allows it.
    h.ledger
        .submit(&addr(EVE), LedgerCall::Claim { identifier: id })
        .await
        .unwrap();

    // Eve cannot use the notification path; she is not the recipient.
    assert!(matches!(
        h.coordinator.acknowledge_claim(&id, &addr(EVE)).await,
        Err(SettlementError::WrongClaimer { .. })
    ));

    let report = h.coordinator.reconcile().await.unwrap();
    assert_eq!(report.mismatches, 1);
    let record = h.coordinator.transfer_status(&id).unwrap();
    assert_eq!(record.status, TransferStatus::Claimed);
    assert_eq!(record.resolved_by, Some(addr(EVE)));
    assert!(record.claimer_mismatch);
}

#[tokio::test]
async fn cancel_after_window_reconciles_to_cancelled() {
    let h = setup();
    let id = h
        .coordinator
        .initiate_transfer(ALICE, BOB, 10 * ONE, "ETH")
        .await
        .unwrap()
        .transfer
        .identifier;

    h.clock.advance(CANCEL_WINDOW_SECS - 1);
    assert!(h
        .ledger
        .submit(&addr(ALICE), LedgerCall::Cancel { identifier: id })
        .await
        .is_err());

    h.clock.advance(1);
    h.ledger
        .submit(&addr(ALICE), LedgerCall::Cancel { identifier: id })
        .await
        .unwrap();

    h.coordinator.reconcile().await.unwrap();
    let record = h.coordinator.transfer_status(&id).unwrap();
    assert_eq!(record.status, TransferStatus::Cancelled);
    assert_eq!(record.resolved_by, Some(addr(ALICE)));
    assert_eq!(h.coordinator.index().get_stats().unwrap().cancelled, 1);
}

#[tokio::test]
async fn insufficient_balance_discards_pending_record() {
    let h = setup();
    let err = h
        .coordinator
        .initiate_transfer(BOB, ALICE, ONE, "ETH")
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::LedgerRefused { .. }));
    assert_eq!(h.coordinator.index().transfer_count(), 0);
    assert!(h.coordinator.list_pending_for(&addr(ALICE)).unwrap().is_empty());
}

#[tokio::test]
async fn reconcile_resumes_from_persisted_cursor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index");
    let clock = Arc::new(ManualClock::new(T0));
    let escrow = EscrowLedger::new(addr(ADMIN), 0, addr(COLLECTOR)).unwrap();
    let ledger = InProcessLedger::new(escrow, clock);
    let eth = TokenRegistry::default().resolve("ETH").unwrap();
    ledger.fund(&addr(ALICE), &eth, 10 * ONE).unwrap();

    let id = {
        let coordinator = SettlementCoordinator::new(
            CommitmentGenerator::default(),
            TransferIndex::open(&path).unwrap(),
            Arc::new(ledger.clone()),
            CoordinatorConfig::default(),
        );
        let id = coordinator
            .initiate_transfer(ALICE, BOB, ONE, "ETH")
            .await
            .unwrap()
            .transfer
            .identifier;
        assert_eq!(coordinator.reconcile().await.unwrap().cursor, 1);
        id
    };

    ledger
        .submit(&addr(BOB), LedgerCall::Claim { identifier: id })
        .await
        .unwrap();

    // A restarted coordinator only reads the new event.
    let coordinator = SettlementCoordinator::new(
        CommitmentGenerator::default(),
        TransferIndex::open(&path).unwrap(),
        Arc::new(ledger.clone()),
        CoordinatorConfig::default(),
    );
    let report = coordinator.reconcile().await.unwrap();
    assert_eq!(report.events, 1);
    assert_eq!(report.cursor, 2);
    assert_eq!(
        coordinator.index().get_status(&id).unwrap(),
        TransferStatus::Claimed
    );
}

#[tokio::test]
async fn many_transfers_across_partitions() {
    let h = setup();
    let mut ids = Vec::new();
    for i in 0..10u128 {
        let recipient = if i % 2 == 0 { BOB } else { EVE };
        ids.push(
            h.coordinator
                .initiate_transfer(ALICE, recipient, ONE + i, "ETH")
                .await
                .unwrap()
                .transfer
                .identifier,
        );
    }
    for (i, id) in ids.iter().enumerate() {
        let claimer = if i % 2 == 0 { BOB } else { EVE };
        h.ledger
            .submit(&addr(claimer), LedgerCall::Claim { identifier: *id })
            .await
            .unwrap();
    }

    let report = h.coordinator.reconcile().await.unwrap();
    assert_eq!(report.events, 20);
    assert_eq!(report.applied, 10);
    assert_eq!(report.mismatches, 0);
    let stats = h.coordinator.index().get_stats().unwrap();
    assert_eq!(stats.claimed, 10);
    assert_eq!(stats.pending, 0);
    assert!(h.coordinator.audit_pending().await.unwrap().is_empty());
}
