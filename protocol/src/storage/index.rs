//! # TransferIndex: Off-Ledger Index
//!
//! The durable map from transfer identifier to everything the ledger does not
//! know: who the recipient is, what was promised, the salt, and where the
//! transfer is in its lifecycle. Built on sled.
//!
//! ## Tree Layout
//!
//! | Tree                   | Key                                          | Value                  |
//! |------------------------|----------------------------------------------|------------------------|
//! | `transfers`            | `identifier` (32B)                           | `bincode(IndexRecord)` |
//! | `pending_by_recipient` | `recipient` (20B) ‖ `created_at` (8B BE) ‖ `identifier` (32B) | `identifier` (32B) |
//! | `metadata`             | key (UTF-8)                                  | value (bytes)          |
//!
//! `pending_by_recipient` holds an entry exactly while the record is pending.
//! Timestamps are big-endian so a prefix scan over one recipient returns
//! their transfers in creation order without sorting.
//!
//! ## Concurrency
//!
//! Every write runs as a sled transaction over `transfers` and
//! `pending_by_recipient` together. sled serializes conflicting transactions,
//! so two writers racing on the same identifier see each other's result: the
//! first resolution wins and the second observes a terminal record. Reads are
//! lock-free and may observe a record a moment before a concurrent
//! resolution lands.
//!
//! ## Durability
//!
//! Writes flush before returning. A pending record that only lived in a
//! write buffer would be an escrow nobody can route.

use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;

use super::record::{
    AddressStats, Correction, IndexRecord, IndexStats, Resolution, Transition,
};
use crate::transfer::{Address, Amount, TransferId, TransferStatus};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("duplicate identifier: {0}")]
    DuplicateIdentifier(TransferId),

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

    #[error("transfer {identifier} already resolved as {status}")]
    AlreadyResolved {
        identifier: TransferId,
        status: TransferStatus,
    },

    #[error("transfer {0} has a confirmed escrow and cannot be discarded")]
    EscrowConfirmed(TransferId),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

// ---------------------------------------------------------------------------
// Keys & encoding
// ---------------------------------------------------------------------------

/// Well-known key in the `metadata` tree for the reconciliation cursor.
const META_RECONCILE_CURSOR: &[u8] = b"reconcile_cursor";

fn pending_key(recipient: &Address, created_at: DateTime<Utc>, identifier: &TransferId) -> Vec<u8> {
    let mut key = Vec::with_capacity(20 + 8 + 32);
    key.extend_from_slice(recipient.as_bytes());
    key.extend_from_slice(&(created_at.timestamp().max(0) as u64).to_be_bytes());
    key.extend_from_slice(identifier.as_bytes());
    key
}

fn encode(record: &IndexRecord) -> IndexResult<Vec<u8>> {
    bincode::serialize(record).map_err(|e| IndexError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> IndexResult<IndexRecord> {
    bincode::deserialize(bytes).map_err(|e| IndexError::Serialization(e.to_string()))
}

fn decode_id(bytes: &[u8]) -> IndexResult<TransferId> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| IndexError::Serialization("invalid identifier bytes".to_string()))?;
    Ok(TransferId::from_bytes(raw))
}

fn unwrap_tx<T>(result: Result<T, TransactionError<IndexError>>) -> IndexResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => IndexError::Sled(inner),
    })
}

/// What a record-update closure wants done.
enum Step<T> {
    /// Persist the (mutated) record and return the value.
    Write(T),
    /// Leave storage untouched and return the value.
    Keep(T),
}

// ---------------------------------------------------------------------------
// TransferIndex
// ---------------------------------------------------------------------------

/// Durable, concurrently accessible index of hidden transfers.
///
/// Cheap to clone; clones share the same sled handles and can be moved
/// across threads and tasks freely.
#[derive(Debug, Clone)]
pub struct TransferIndex {
    db: Db,
    transfers: Tree,
    pending_by_recipient: Tree,
    metadata: Tree,
}

impl TransferIndex {
    /// Open or create an index at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> IndexResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary index that is deleted when dropped. For tests.
    pub fn open_temporary() -> IndexResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> IndexResult<Self> {
        let transfers = db.open_tree("transfers")?;
        let pending_by_recipient = db.open_tree("pending_by_recipient")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            transfers,
            pending_by_recipient,
            metadata,
        })
    }

    // -- Writes -------------------------------------------------------------

    /// Persist a new pending transfer.
    ///
    /// # Errors
    ///
    /// [`IndexError::DuplicateIdentifier`] if the identifier is already
    /// present, whatever its status. The existing record is left untouched.
    pub fn record_pending(&self, record: &IndexRecord) -> IndexResult<()> {
        let key = record.identifier.as_bytes();
        let pkey = pending_key(&record.recipient, record.created_at, &record.identifier);
        let bytes = encode(record)?;

        let result = (&self.transfers, &self.pending_by_recipient).transaction(
            |(transfers, pending)| {
                if transfers.get(&key[..])?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        IndexError::DuplicateIdentifier(record.identifier),
                    ));
                }
                transfers.insert(&key[..], bytes.clone())?;
                pending.insert(pkey.clone(), &key[..])?;
                Ok(())
            },
        );
        unwrap_tx(result)?;
        self.db.flush()?;

        tracing::debug!(identifier = %record.identifier, "pending transfer recorded");
        Ok(())
    }

    /// Record that `recipient`'s transfer was claimed on the ledger.
    ///
    /// Replaying the same claim is a no-op that returns
    /// [`Transition::Unchanged`].
    ///
    /// # Errors
    ///
    /// - [`IndexError::NotFound`] for an unknown identifier.
    /// - [`IndexError::WrongClaimer`] if `claimer` is not the recipient.
    /// - [`IndexError::AlreadyResolved`] if the transfer was cancelled, or
    ///   claimed by a different address.
    pub fn mark_claimed(
        &self,
        identifier: &TransferId,
        claimer: &Address,
        claimed_at: DateTime<Utc>,
    ) -> IndexResult<Transition> {
        self.update_record(identifier, |record| {
            if record.recipient != *claimer {
                return Err(IndexError::WrongClaimer {
                    identifier: *identifier,
                    expected: record.recipient,
                    got: *claimer,
                });
            }
            match record.status {
                TransferStatus::Claimed if record.resolved_by == Some(*claimer) => {
                    Ok(Step::Keep(Transition::Unchanged))
                }
                TransferStatus::Claimed | TransferStatus::Cancelled => {
                    Err(IndexError::AlreadyResolved {
                        identifier: *identifier,
                        status: record.status,
                    })
                }
                TransferStatus::Pending => {
                    record.status = TransferStatus::Claimed;
                    record.resolved_at = Some(claimed_at);
                    record.resolved_by = Some(*claimer);
                    Ok(Step::Write(Transition::Applied))
                }
            }
        })
    }

    /// Record that the sender reclaimed the transfer on the ledger.
    ///
    /// Same idempotency and conflict rules as [`mark_claimed`](Self::mark_claimed),
    /// with the sender in place of the recipient.
    pub fn mark_cancelled(
        &self,
        identifier: &TransferId,
        canceller: &Address,
        cancelled_at: DateTime<Utc>,
    ) -> IndexResult<Transition> {
        self.update_record(identifier, |record| {
            if record.sender != *canceller {
                return Err(IndexError::WrongCanceller {
                    identifier: *identifier,
                    expected: record.sender,
                    got: *canceller,
                });
            }
            match record.status {
                TransferStatus::Cancelled => Ok(Step::Keep(Transition::Unchanged)),
                TransferStatus::Claimed => Err(IndexError::AlreadyResolved {
                    identifier: *identifier,
                    status: record.status,
                }),
                TransferStatus::Pending => {
                    record.status = TransferStatus::Cancelled;
                    record.resolved_at = Some(cancelled_at);
                    record.resolved_by = Some(*canceller);
                    Ok(Step::Write(Transition::Applied))
                }
            }
        })
    }

    /// Record the ledger's publish confirmation. Idempotent; the first
    /// observation wins.
    pub fn mark_published(
        &self,
        identifier: &TransferId,
        escrowed_amount: Amount,
        published_at: DateTime<Utc>,
    ) -> IndexResult<Transition> {
        self.update_record(identifier, |record| {
            if record.published_at.is_some() {
                return Ok(Step::Keep(Transition::Unchanged));
            }
            record.published_at = Some(published_at);
            record.escrowed_amount = Some(escrowed_amount);
            Ok(Step::Write(Transition::Applied))
        })
    }

    /// Force the record into the state the ledger's event stream dictates.
    ///
    /// Reconciliation uses this once the normal `mark_*` path refused an
    /// event: a claim executed by someone other than the recipient, or a
    /// status the index reached optimistically that the ledger contradicts.
    /// Returns the overwrite performed, `None` if the record already agreed.
    pub fn apply_ledger_resolution(
        &self,
        identifier: &TransferId,
        resolution: Resolution,
        actor: &Address,
        at: DateTime<Utc>,
    ) -> IndexResult<Option<Correction>> {
        self.update_record(identifier, |record| {
            let status = resolution.status();
            if record.status == status && record.resolved_by == Some(*actor) {
                return Ok(Step::Keep(None));
            }
            let correction = Correction {
                identifier: *identifier,
                previous_status: record.status,
                previous_actor: record.resolved_by,
                status,
                actor: *actor,
            };
            record.status = status;
            record.resolved_at = Some(at);
            record.resolved_by = Some(*actor);
            record.claimer_mismatch =
                resolution == Resolution::Claimed && record.recipient != *actor;
            Ok(Step::Write(Some(correction)))
        })
    }

    /// Remove a pending record whose publish never reached the ledger.
    ///
    /// # Errors
    ///
    /// [`IndexError::EscrowConfirmed`] once a publish has been observed and
    /// [`IndexError::AlreadyResolved`] for terminal records.
    pub fn discard_unpublished(&self, identifier: &TransferId) -> IndexResult<IndexRecord> {
        let key = identifier.as_bytes();
        let result = (&self.transfers, &self.pending_by_recipient).transaction(
            |(transfers, pending)| {
                let bytes = transfers.get(&key[..])?.ok_or(
                    ConflictableTransactionError::Abort(IndexError::NotFound(*identifier)),
                )?;
                let record = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if record.status.is_terminal() {
                    return Err(ConflictableTransactionError::Abort(
                        IndexError::AlreadyResolved {
                            identifier: *identifier,
                            status: record.status,
                        },
                    ));
                }
                if record.is_published() {
                    return Err(ConflictableTransactionError::Abort(
                        IndexError::EscrowConfirmed(*identifier),
                    ));
                }
                transfers.remove(&key[..])?;
                pending.remove(pending_key(&record.recipient, record.created_at, identifier))?;
                Ok(record)
            },
        );
        let record = unwrap_tx(result)?;
        self.db.flush()?;
        tracing::info!(identifier = %identifier, "unpublished transfer discarded");
        Ok(record)
    }

    /// Read-modify-write of one record inside a transaction. Keeps
    /// `pending_by_recipient` in step when the status leaves `Pending`.
    fn update_record<T>(
        &self,
        identifier: &TransferId,
        apply: impl Fn(&mut IndexRecord) -> IndexResult<Step<T>>,
    ) -> IndexResult<T> {
        let key = identifier.as_bytes();
        let result = (&self.transfers, &self.pending_by_recipient).transaction(
            |(transfers, pending)| {
                let bytes = transfers.get(&key[..])?.ok_or(
                    ConflictableTransactionError::Abort(IndexError::NotFound(*identifier)),
                )?;
                let mut record = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                let was_pending = record.status == TransferStatus::Pending;

                match apply(&mut record).map_err(ConflictableTransactionError::Abort)? {
                    Step::Keep(out) => Ok((out, false)),
                    Step::Write(out) => {
                        let encoded = encode(&record).map_err(ConflictableTransactionError::Abort)?;
                        transfers.insert(&key[..], encoded)?;
                        if was_pending && record.status != TransferStatus::Pending {
                            pending.remove(pending_key(
                                &record.recipient,
                                record.created_at,
                                identifier,
                            ))?;
                        }
                        Ok((out, true))
                    }
                }
            },
        );
        let (out, written) = unwrap_tx(result)?;
        if written {
            self.db.flush()?;
        }
        Ok(out)
    }

    // -- Reads --------------------------------------------------------------

    /// Full record for an identifier.
    pub fn get(&self, identifier: &TransferId) -> IndexResult<Option<IndexRecord>> {
        match self.transfers.get(identifier.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Current status of an identifier.
    pub fn get_status(&self, identifier: &TransferId) -> IndexResult<TransferStatus> {
        self.get(identifier)?
            .map(|r| r.status)
            .ok_or(IndexError::NotFound(*identifier))
    }

    /// Pending transfers addressed to `recipient`, oldest first.
    pub fn lookup_pending_by_recipient(&self, recipient: &Address) -> IndexResult<Vec<IndexRecord>> {
        let mut out = Vec::new();
        for entry in self.pending_by_recipient.scan_prefix(recipient.as_bytes()) {
            let (_key, value) = entry?;
            let identifier = decode_id(&value)?;
            // The entry can outlive its record's pending state by a moment
            // under a concurrent resolution; re-check the record itself.
            if let Some(record) = self.get(&identifier)? {
                if record.status == TransferStatus::Pending {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Every pending record, in no particular order.
    pub fn pending_records(&self) -> IndexResult<Vec<IndexRecord>> {
        let mut out = Vec::new();
        for entry in self.pending_by_recipient.iter() {
            let (_key, value) = entry?;
            if let Some(record) = self.get(&decode_id(&value)?)? {
                if record.status == TransferStatus::Pending {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// `true` if the identifier exists, is pending, and belongs to `address`.
    pub fn verify_recipient(&self, identifier: &TransferId, address: &Address) -> IndexResult<bool> {
        Ok(self
            .get(identifier)?
            .map(|r| r.status == TransferStatus::Pending && r.recipient == *address)
            .unwrap_or(false))
    }

    /// Aggregate counts by status.
    pub fn get_stats(&self) -> IndexResult<IndexStats> {
        let mut stats = IndexStats::default();
        for entry in self.transfers.iter() {
            let (_key, value) = entry?;
            let record = decode(&value)?;
            stats.total += 1;
            match record.status {
                TransferStatus::Pending => stats.pending += 1,
                TransferStatus::Claimed => stats.claimed += 1,
                TransferStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    /// Activity counts for one address.
    pub fn address_stats(&self, address: &Address) -> IndexResult<AddressStats> {
        let mut stats = AddressStats::default();
        for entry in self.transfers.iter() {
            let (_key, value) = entry?;
            let record = decode(&value)?;
            if record.sender == *address {
                stats.total_sent += 1;
            }
            if record.recipient == *address {
                match record.status {
                    TransferStatus::Claimed => stats.total_received += 1,
                    TransferStatus::Pending => stats.pending_incoming += 1,
                    TransferStatus::Cancelled => {}
                }
            }
        }
        Ok(stats)
    }

    /// Number of records stored, in any status.
    pub fn transfer_count(&self) -> usize {
        self.transfers.len()
    }

    // -- Metadata -----------------------------------------------------------

    /// Sequence number of the last ledger event reconciliation applied.
    pub fn reconcile_cursor(&self) -> IndexResult<u64> {
        match self.metadata.get(META_RECONCILE_CURSOR)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| IndexError::Serialization("invalid cursor bytes".to_string()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Persist the reconciliation cursor.
    pub fn set_reconcile_cursor(&self, seq: u64) -> IndexResult<()> {
        self.metadata
            .insert(META_RECONCILE_CURSOR, &seq.to_be_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Force a flush of all pending writes to disk.
    pub fn flush(&self) -> IndexResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
