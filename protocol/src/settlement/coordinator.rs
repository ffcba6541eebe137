//! # SettlementCoordinator
//!
//! Drives a hidden transfer end to end and keeps the index aligned with the
//! ledger.
//!
//! ## Publish
//!
//! ```text
//! prepare_transfer ─▶ Generator ─▶ Index.record_pending ─▶ PreparedTransfer
//!                                                               │
//! initiate_transfer ───────────────────────────────────────────▶ submit(Publish)
//!        confirmed ─▶ Index.mark_published
//!        timeout   ─▶ read escrow (backoff) ─▶ present: mark_published
//!                                            └▶ absent:  PublishUnconfirmed
//!        refused   ─▶ read escrow ─▶ absent: discard_unpublished
//! ```
//!
//! The index record is written before the ledger is touched. A publish that
//! lands without an index record is an escrow nobody can route; a record
//! without a publish is merely noise, and is cleaned up once the ledger
//! refuses it.
//!
//! ## Reconcile
//!
//! Ledger events after the persisted cursor are read in batches, split by
//! identifier across blocking worker tasks, and applied idempotently. The
//! cursor only moves after a whole batch succeeds. Passes are serialized by
//! an async mutex, so the background loop and an on-demand call never race
//! the cursor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::error::SettlementError;
use super::reconcile::{apply_partition, ledger_time, partition_of, ReconcileReport};
use super::retry::RetryPolicy;
use crate::config::{DEFAULT_CONFIRMATION_TIMEOUT, DEFAULT_RECONCILE_BATCH, DEFAULT_RECONCILE_WORKERS};
use crate::ledger::{ClientError, LedgerCall, LedgerClient, LedgerEvent, LedgerEventKind};
use crate::storage::{IndexError, IndexRecord, TransferIndex, Transition};
use crate::transfer::{Address, Amount, CommitmentGenerator, Salt, Token, TransferId};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long to wait for a submitted publish before checking the ledger.
    pub confirmation_timeout: Duration,
    /// Maximum events pulled per reconciliation batch.
    pub reconcile_batch: usize,
    /// Number of identifier partitions per batch.
    pub reconcile_workers: usize,
    /// Backoff for idempotent ledger reads.
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            reconcile_batch: DEFAULT_RECONCILE_BATCH,
            reconcile_workers: DEFAULT_RECONCILE_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A transfer recorded in the index and ready for the sender to publish.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedTransfer {
    pub identifier: TransferId,
    pub salt: Salt,
    pub created_at: DateTime<Utc>,
    pub sender: Address,
    pub token: Token,
    pub amount: Amount,
    /// The call the sender's signing client must submit.
    pub publish: LedgerCall,
}

/// A transfer whose publish the ledger confirmed.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub identifier: TransferId,
    /// Amount held in escrow, after the fee.
    pub escrowed_amount: Amount,
    pub published_at: DateTime<Utc>,
}

/// Outcome of [`SettlementCoordinator::initiate_transfer`].
#[derive(Debug, Clone, Serialize)]
pub struct InitiatedTransfer {
    pub transfer: PreparedTransfer,
    pub receipt: PublishReceipt,
}

/// Why a pending record failed the ledger audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditIssue {
    /// The ledger has no escrow for the identifier.
    NotEscrowed,
    /// The ledger escrow is already settled but the index still says pending.
    SettledOnLedger,
}

/// A pending record the ledger disagrees with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFinding {
    pub identifier: TransferId,
    pub issue: AuditIssue,
}

/// Removes an identifier from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a DashMap<TransferId, ()>,
    identifier: TransferId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.identifier);
    }
}

// ---------------------------------------------------------------------------
// SettlementCoordinator
// ---------------------------------------------------------------------------

/// Orchestrates generator, index and ledger client.
///
/// Shared behind an `Arc` by the HTTP handlers and the reconcile loop.
pub struct SettlementCoordinator<C: LedgerClient> {
    generator: CommitmentGenerator,
    index: TransferIndex,
    client: Arc<C>,
    config: CoordinatorConfig,
    in_flight: DashMap<TransferId, ()>,
    reconcile_lock: Mutex<()>,
}

impl<C: LedgerClient> SettlementCoordinator<C> {
    pub fn new(
        generator: CommitmentGenerator,
        index: TransferIndex,
        client: Arc<C>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            generator,
            index,
            client,
            config,
            in_flight: DashMap::new(),
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn index(&self) -> &TransferIndex {
        &self.index
    }

    pub fn generator(&self) -> &CommitmentGenerator {
        &self.generator
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // -- Publish ------------------------------------------------------------

    /// Generates an identifier and records the transfer as pending.
    ///
    /// Nothing is sent to the ledger. The returned [`LedgerCall`] is what
    /// the sender signs and submits.
    pub fn prepare_transfer(
        &self,
        sender: &str,
        recipient: &str,
        amount: Amount,
        token: &str,
    ) -> Result<PreparedTransfer, SettlementError> {
        let commitment = self
            .generator
            .create_identifier(sender, recipient, amount, token)?;
        self.index.record_pending(&IndexRecord::from(&commitment))?;

        info!(
            identifier = %commitment.identifier,
            sender = %commitment.sender,
            token = %commitment.token,
            "transfer prepared"
        );

        Ok(PreparedTransfer {
            identifier: commitment.identifier,
            publish: LedgerCall::Publish {
                identifier: commitment.identifier,
                token: commitment.token.clone(),
                amount: commitment.amount,
            },
            salt: commitment.salt,
            created_at: commitment.created_at,
            sender: commitment.sender,
            token: commitment.token,
            amount: commitment.amount,
        })
    }

    /// Prepares a transfer and publishes it through the ledger client.
    pub async fn initiate_transfer(
        &self,
        sender: &str,
        recipient: &str,
        amount: Amount,
        token: &str,
    ) -> Result<InitiatedTransfer, SettlementError> {
        let transfer = self.prepare_transfer(sender, recipient, amount, token)?;
        let receipt = self.publish(&transfer).await?;
        Ok(InitiatedTransfer { transfer, receipt })
    }

    /// Submits the publish call for a prepared transfer.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::PublishInFlight`] if a publish for the same
    ///   identifier is still running.
    /// - [`SettlementError::PublishUnconfirmed`] if no confirmation arrived
    ///   and the ledger does not show the escrow. The record stays pending;
    ///   reconciliation picks the publish up if it lands later.
    /// - [`SettlementError::LedgerRefused`] if the signer or ledger refused
    ///   the call. The pending record is discarded unless the ledger holds
    ///   an escrow under the identifier.
    pub async fn publish(
        &self,
        transfer: &PreparedTransfer,
    ) -> Result<PublishReceipt, SettlementError> {
        let identifier = transfer.identifier;
        let _guard = self.claim_in_flight(identifier)?;

        let submitted = tokio::time::timeout(
            self.config.confirmation_timeout,
            self.client.submit(&transfer.sender, transfer.publish.clone()),
        )
        .await
        .unwrap_or(Err(ClientError::Timeout));

        match submitted {
            Ok(event) => self.confirm_published(&identifier, &event),
            Err(e) if e.is_transient() => {
                warn!(identifier = %identifier, error = %e, "publish unconfirmed, checking ledger");
                match self.read_escrow(&identifier).await {
                    Ok(Some(escrow)) => {
                        let published_at = ledger_time(escrow.created_at);
                        self.index
                            .mark_published(&identifier, escrow.amount, published_at)?;
                        info!(identifier = %identifier, "publish found on ledger after timeout");
                        Ok(PublishReceipt {
                            identifier,
                            escrowed_amount: escrow.amount,
                            published_at,
                        })
                    }
                    Ok(None) | Err(_) => Err(SettlementError::PublishUnconfirmed(identifier)),
                }
            }
            Err(e) => {
                // Refused outright. Only drop the record when the ledger is
                // known not to hold anything under this identifier.
                if let Ok(None) = self.read_escrow(&identifier).await {
                    match self.index.discard_unpublished(&identifier) {
                        Ok(_) | Err(IndexError::NotFound(_)) => {}
                        Err(other) => {
                            warn!(identifier = %identifier, error = %other, "could not discard refused transfer");
                        }
                    }
                }
                warn!(identifier = %identifier, error = %e, "publish refused");
                Err(SettlementError::LedgerRefused {
                    identifier,
                    source: e,
                })
            }
        }
    }

    fn claim_in_flight(&self, identifier: TransferId) -> Result<InFlightGuard<'_>, SettlementError> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(identifier) {
            Entry::Occupied(_) => Err(SettlementError::PublishInFlight(identifier)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightGuard {
                    set: &self.in_flight,
                    identifier,
                })
            }
        }
    }

    fn confirm_published(
        &self,
        identifier: &TransferId,
        event: &LedgerEvent,
    ) -> Result<PublishReceipt, SettlementError> {
        let escrowed_amount = match &event.kind {
            LedgerEventKind::Published {
                identifier: published,
                net_amount,
                ..
            } if published == identifier => *net_amount,
            other => {
                return Err(SettlementError::Inconsistent(format!(
                    "publish of {identifier} confirmed with unexpected event {other:?}"
                )))
            }
        };
        let published_at = ledger_time(event.block_time);
        self.index
            .mark_published(identifier, escrowed_amount, published_at)?;
        info!(
            identifier = %identifier,
            seq = event.seq,
            escrowed = %escrowed_amount,
            "publish confirmed"
        );
        Ok(PublishReceipt {
            identifier: *identifier,
            escrowed_amount,
            published_at,
        })
    }

    async fn read_escrow(
        &self,
        identifier: &TransferId,
    ) -> Result<Option<crate::ledger::EscrowRecord>, ClientError> {
        self.config
            .retry
            .run("escrow", || self.client.escrow(identifier))
            .await
    }

    // -- Claim --------------------------------------------------------------

    /// Records a recipient's claim notification.
    ///
    /// The ledger must already show the escrow settled. This never moves
    /// funds; it only lets the index catch up before reconciliation does.
    pub async fn acknowledge_claim(
        &self,
        identifier: &TransferId,
        claimer: &Address,
    ) -> Result<Transition, SettlementError> {
        if self.index.get(identifier)?.is_none() {
            return Err(SettlementError::NotFound(*identifier));
        }
        let settled = self
            .read_escrow(identifier)
            .await?
            .map(|escrow| escrow.claimed)
            .unwrap_or(false);
        if !settled {
            return Err(SettlementError::NotSettledOnLedger(*identifier));
        }

        let transition = self.index.mark_claimed(identifier, claimer, Utc::now())?;
        debug!(identifier = %identifier, claimer = %claimer, ?transition, "claim acknowledged");
        Ok(transition)
    }

    // -- Queries ------------------------------------------------------------

    /// Pending transfers for `recipient`, oldest first.
    pub fn list_pending_for(&self, recipient: &Address) -> Result<Vec<IndexRecord>, SettlementError> {
        Ok(self.index.lookup_pending_by_recipient(recipient)?)
    }

    /// The index record for an identifier.
    pub fn transfer_status(&self, identifier: &TransferId) -> Result<IndexRecord, SettlementError> {
        self.index
            .get(identifier)?
            .ok_or(SettlementError::NotFound(*identifier))
    }

    /// Compares every pending record with the ledger.
    ///
    /// Read-only. Findings are what the next reconciliation pass should fix
    /// (`SettledOnLedger`) or what never got published (`NotEscrowed`).
    pub async fn audit_pending(&self) -> Result<Vec<AuditFinding>, SettlementError> {
        let mut findings = Vec::new();
        for record in self.index.pending_records()? {
            let issue = match self.read_escrow(&record.identifier).await? {
                None => Some(AuditIssue::NotEscrowed),
                Some(escrow) if escrow.claimed => Some(AuditIssue::SettledOnLedger),
                Some(_) => None,
            };
            if let Some(issue) = issue {
                debug!(identifier = %record.identifier, ?issue, "audit finding");
                findings.push(AuditFinding {
                    identifier: record.identifier,
                    issue,
                });
            }
        }
        Ok(findings)
    }

    // -- Reconcile ----------------------------------------------------------

    /// Drains ledger events after the persisted cursor into the index.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SettlementError> {
        let _pass = self.reconcile_lock.lock().await;

        let mut report = ReconcileReport {
            cursor: self.index.reconcile_cursor()?,
            ..ReconcileReport::default()
        };
        let batch = self.config.reconcile_batch.max(1);
        let workers = self.config.reconcile_workers.max(1);

        loop {
            let cursor = report.cursor;
            let events = self
                .config
                .retry
                .run("events_since", || self.client.events_since(cursor, batch))
                .await?;
            let Some(last_seq) = events.last().map(|e| e.seq) else {
                break;
            };
            let read = events.len();

            let mut partitions: Vec<Vec<LedgerEvent>> = vec![Vec::new(); workers];
            for event in events {
                if let Some(identifier) = event.identifier() {
                    let slot = partition_of(identifier, workers);
                    partitions[slot].push(event);
                }
            }

            let tasks = partitions
                .into_iter()
                .filter(|p| !p.is_empty())
                .map(|partition| {
                    let index = self.index.clone();
                    tokio::task::spawn_blocking(move || apply_partition(&index, &partition))
                });
            for joined in futures::future::join_all(tasks).await {
                let outcome = joined
                    .map_err(|e| SettlementError::Internal(format!("reconcile worker failed: {e}")))??;
                report.absorb(&outcome);
            }

            self.index.set_reconcile_cursor(last_seq)?;
            report.cursor = last_seq;
            report.events += read as u64;

            if read < batch {
                break;
            }
        }

        if report.events > 0 {
            info!(
                events = report.events,
                applied = report.applied,
                corrections = report.corrections,
                mismatches = report.mismatches,
                cursor = report.cursor,
                "reconcile pass complete"
            );
        }
        Ok(report)
    }

    /// Runs [`reconcile`](Self::reconcile) every `interval` until `shutdown`
    /// flips to `true` or its sender is dropped. `on_pass` sees every
    /// successful report.
    pub async fn run_reconcile_loop<F>(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut on_pass: F,
    ) where
        F: FnMut(&ReconcileReport) + Send,
    {
        info!(interval_ms = interval.as_millis() as u64, "reconcile loop starting");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.reconcile().await {
                Ok(report) => on_pass(&report),
                Err(e) => warn!(error = %e, class = ?e.class(), "reconcile pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("reconcile loop stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
