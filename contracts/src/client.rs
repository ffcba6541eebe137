//! An in-process [`LedgerClient`] backed by an [`EscrowLedger`].
//!
//! Stands in for a signing wallet plus a remote chain: `submit` executes the
//! call immediately under a mutex, stamped with the clock's time. Contract
//! refusals come back as [`ClientError::Reverted`].

use std::sync::Arc;

use async_trait::async_trait;
use cloak_protocol::ledger::{ClientError, EscrowRecord, LedgerCall, LedgerClient, LedgerEvent};
use cloak_protocol::transfer::{Address, Amount, Token, TransferId};
use parking_lot::Mutex;

use crate::clock::LedgerClock;
use crate::hidden_escrow::{EscrowError, EscrowLedger};

/// Shared handle to an in-memory ledger. Clones share state.
#[derive(Clone)]
pub struct InProcessLedger {
    ledger: Arc<Mutex<EscrowLedger>>,
    clock: Arc<dyn LedgerClock>,
}

impl InProcessLedger {
    pub fn new(ledger: EscrowLedger, clock: Arc<dyn LedgerClock>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(ledger)),
            clock,
        }
    }

    /// Current ledger time.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Runs `f` against a consistent snapshot of the ledger.
    pub fn read<R>(&self, f: impl FnOnce(&EscrowLedger) -> R) -> R {
        f(&*self.ledger.lock())
    }

    /// Runs `f` with exclusive access, passing the current time. Used for
    /// the administrative calls that have no [`LedgerCall`] form.
    pub fn write<R>(&self, f: impl FnOnce(&mut EscrowLedger, u64) -> R) -> R {
        let now = self.clock.now();
        f(&mut *self.ledger.lock(), now)
    }

    /// Credits `account` with tokens from outside the ledger.
    pub fn fund(&self, account: &Address, token: &Token, amount: Amount) -> Result<(), EscrowError> {
        self.ledger.lock().fund_account(account, token, amount)
    }
}

fn reverted(err: EscrowError) -> ClientError {
    ClientError::Reverted(err.to_string())
}

#[async_trait]
impl LedgerClient for InProcessLedger {
    async fn submit(&self, caller: &Address, call: LedgerCall) -> Result<LedgerEvent, ClientError> {
        let now = self.clock.now();
        let result = self.ledger.lock().execute(caller, &call, now);
        match &result {
            Ok(event) => tracing::debug!(seq = event.seq, caller = %caller, "ledger call executed"),
            Err(e) => tracing::debug!(caller = %caller, error = %e, "ledger call reverted"),
        }
        result.map_err(reverted)
    }

    async fn escrow(&self, identifier: &TransferId) -> Result<Option<EscrowRecord>, ClientError> {
        Ok(self.ledger.lock().record(identifier).cloned())
    }

    async fn events_since(&self, cursor: u64, limit: usize) -> Result<Vec<LedgerEvent>, ClientError> {
        Ok(self.ledger.lock().events_since(cursor, limit))
    }
}
