//! # Hidden Escrow Contract
//!
//! Holds funds under opaque transfer identifiers. The ledger never learns
//! who a transfer is for; whoever presents the identifier can claim it.
//!
//! Per identifier:
//!
//! 1. **Unpublished**: no record.
//! 2. **Escrowed**: `publish` debited the sender, took the fee, and stored
//!    the remainder with `claimed = false`.
//! 3. **Settled**: `claim` (anyone holding the identifier) or `cancel`
//!    (the sender, after the cancellation window) paid the escrow out and
//!    set `claimed = true`. Terminal; the record is never deleted.
//!
//! Every operation takes the caller and the ledger time explicitly and runs
//! on `&mut self`, so transactions execute one at a time. Every state change
//! appends to the event log, which is the only thing the off-ledger side
//! reads to catch up.

use std::collections::{BTreeMap, HashMap};

use cloak_protocol::config::{BPS_DENOMINATOR, CANCEL_WINDOW_SECS, MAX_FEE_BPS};
use cloak_protocol::ledger::{EscrowRecord, LedgerCall, LedgerEvent, LedgerEventKind};
use cloak_protocol::transfer::{Address, Amount, Token, TransferId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons the contract refuses a call. A refused call changes nothing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscrowError {
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("an escrow already exists for {0}")]
    AlreadyExists(TransferId),

    #[error("no escrow for {0}")]
    NotFound(TransferId),

    #[error("escrow {0} is already settled")]
    AlreadyClaimed(TransferId),

    #[error("only the sender may cancel {0}")]
    NotSender(TransferId),

    #[error("escrow {identifier} cannot be cancelled before {available_at}")]
    TooEarly {
        identifier: TransferId,
        /// Ledger time at which cancellation opens.
        available_at: u64,
    },

    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Amount, available: Amount },

    #[error("fee rate {0} bps exceeds the cap")]
    FeeTooHigh(u32),

    #[error("caller is not the ledger administrator")]
    NotAdmin,

    #[error("only {available} of {requested} is recoverable")]
    NotRecoverable { requested: Amount, available: Amount },

    #[error("amount overflow")]
    AmountOverflow,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Ledger-wide publish fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Basis points taken from every publish. At most [`MAX_FEE_BPS`].
    pub fee_bps: u32,
    /// Account credited with the fee.
    pub collector: Address,
}

impl FeeConfig {
    /// `floor(amount * fee_bps / 10_000)`.
    pub fn fee_for(&self, amount: Amount) -> Result<Amount, EscrowError> {
        amount
            .checked_mul(self.fee_bps as Amount)
            .map(|scaled| scaled / BPS_DENOMINATOR)
            .ok_or(EscrowError::AmountOverflow)
    }
}

/// Counters exposed by the contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub published: u64,
    pub claimed: u64,
    pub cancelled: u64,
    /// Net amounts currently held for unsettled escrows, per token.
    pub total_escrowed: BTreeMap<Token, Amount>,
    /// Fees collected since deployment, per token.
    pub total_fees: BTreeMap<Token, Amount>,
}

// ---------------------------------------------------------------------------
// EscrowLedger
// ---------------------------------------------------------------------------

/// The contract's entire state.
#[derive(Debug, Clone)]
pub struct EscrowLedger {
    admin: Address,
    fee: FeeConfig,
    escrows: HashMap<TransferId, EscrowRecord>,
    /// Token balances of ordinary accounts.
    balances: HashMap<(Address, Token), Amount>,
    /// Tokens held by the contract itself, escrowed or not.
    custody: HashMap<Token, Amount>,
    stats: LedgerStats,
    events: Vec<LedgerEvent>,
}

impl EscrowLedger {
    /// Deploys a fresh ledger.
    ///
    /// # Errors
    ///
    /// [`EscrowError::FeeTooHigh`] if `fee_bps` exceeds the cap.
    pub fn new(admin: Address, fee_bps: u32, collector: Address) -> Result<Self, EscrowError> {
        if fee_bps > MAX_FEE_BPS {
            return Err(EscrowError::FeeTooHigh(fee_bps));
        }
        Ok(Self {
            admin,
            fee: FeeConfig {
                fee_bps,
                collector,
            },
            escrows: HashMap::new(),
            balances: HashMap::new(),
            custody: HashMap::new(),
            stats: LedgerStats::default(),
            events: Vec::new(),
        })
    }

    /// Dispatches a prepared call.
    pub fn execute(
        &mut self,
        caller: &Address,
        call: &LedgerCall,
        now: u64,
    ) -> Result<LedgerEvent, EscrowError> {
        match call {
            LedgerCall::Publish {
                identifier,
                token,
                amount,
            } => self.publish(caller, identifier, token, *amount, now),
            LedgerCall::Claim { identifier } => self.claim(caller, identifier, now),
            LedgerCall::Cancel { identifier } => self.cancel(caller, identifier, now),
        }
    }

    // -- Transfer lifecycle -------------------------------------------------

    /// Escrows `amount` of `token` from `caller` under `identifier`.
    ///
    /// The fee goes to the collector in the same step; the record holds the
    /// remainder.
    ///
    /// # Errors
    ///
    /// [`EscrowError::ZeroAmount`], [`EscrowError::AlreadyExists`], or
    /// [`EscrowError::InsufficientBalance`] if the caller cannot cover
    /// `amount`.
    pub fn publish(
        &mut self,
        caller: &Address,
        identifier: &TransferId,
        token: &Token,
        amount: Amount,
        now: u64,
    ) -> Result<LedgerEvent, EscrowError> {
        if amount == 0 {
            return Err(EscrowError::ZeroAmount);
        }
        if self.escrows.contains_key(identifier) {
            return Err(EscrowError::AlreadyExists(*identifier));
        }

        let fee = self.fee.fee_for(amount)?;
        let net = amount - fee;

        // Validate every credit before the first debit so a refused call
        // leaves no partial state behind.
        let available = self.balance_of(caller, token);
        if available < amount {
            return Err(EscrowError::InsufficientBalance {
                needed: amount,
                available,
            });
        }
        let collector = self.fee.collector;
        self.balance_of(&collector, token)
            .checked_add(fee)
            .ok_or(EscrowError::AmountOverflow)?;
        self.custody_of(token)
            .checked_add(net)
            .ok_or(EscrowError::AmountOverflow)?;

        self.debit(caller, token, amount)?;
        self.credit(&collector, token, fee)?;
        *self.custody.entry(token.clone()).or_insert(0) += net;
        *self.stats.total_escrowed.entry(token.clone()).or_insert(0) += net;
        *self.stats.total_fees.entry(token.clone()).or_insert(0) += fee;
        self.stats.published += 1;

        self.escrows.insert(
            *identifier,
            EscrowRecord {
                sender: *caller,
                token: token.clone(),
                amount: net,
                created_at: now,
                claimed: false,
            },
        );

        tracing::debug!(identifier = %identifier, token = %token, net = %net, fee = %fee, "escrow published");
        Ok(self.emit(
            now,
            LedgerEventKind::Published {
                identifier: *identifier,
                sender: *caller,
                token: token.clone(),
                net_amount: net,
                fee,
            },
        ))
    }

    /// Pays the escrow to `caller`.
    ///
    /// There is deliberately no recipient check: the identifier is a bearer
    /// instrument. Routing it to the right person is the index's job.
    pub fn claim(
        &mut self,
        caller: &Address,
        identifier: &TransferId,
        now: u64,
    ) -> Result<LedgerEvent, EscrowError> {
        let amount = self.settle(identifier, caller, |_| Ok(()))?;
        self.stats.claimed += 1;

        tracing::debug!(identifier = %identifier, claimer = %caller, "escrow claimed");
        Ok(self.emit(
            now,
            LedgerEventKind::Claimed {
                identifier: *identifier,
                claimer: *caller,
                amount,
            },
        ))
    }

    /// Returns an unclaimed escrow to its sender once the cancellation
    /// window has passed.
    pub fn cancel(
        &mut self,
        caller: &Address,
        identifier: &TransferId,
        now: u64,
    ) -> Result<LedgerEvent, EscrowError> {
        // A non-sender gets NotSender whatever state the escrow is in.
        match self.escrows.get(identifier) {
            None => return Err(EscrowError::NotFound(*identifier)),
            Some(record) if record.sender != *caller => {
                return Err(EscrowError::NotSender(*identifier))
            }
            Some(_) => {}
        }
        let amount = self.settle(identifier, caller, |record| {
            let available_at = record.created_at.saturating_add(CANCEL_WINDOW_SECS);
            if now < available_at {
                return Err(EscrowError::TooEarly {
                    identifier: *identifier,
                    available_at,
                });
            }
            Ok(())
        })?;
        self.stats.cancelled += 1;

        tracing::debug!(identifier = %identifier, "escrow cancelled");
        Ok(self.emit(
            now,
            LedgerEventKind::Cancelled {
                identifier: *identifier,
                sender: *caller,
                amount,
            },
        ))
    }

    /// Shared claim/cancel path: checks the record, runs `check`, then moves
    /// the amount from custody to `payee` and flips `claimed`.
    ///
    /// Every check, including the payee credit, happens before the first
    /// write, so a refusal leaves the record, custody and balances as they
    /// were.
    fn settle(
        &mut self,
        identifier: &TransferId,
        payee: &Address,
        check: impl FnOnce(&EscrowRecord) -> Result<(), EscrowError>,
    ) -> Result<Amount, EscrowError> {
        let record = self
            .escrows
            .get(identifier)
            .ok_or(EscrowError::NotFound(*identifier))?;
        if record.claimed {
            return Err(EscrowError::AlreadyClaimed(*identifier));
        }
        check(record)?;

        let token = record.token.clone();
        let amount = record.amount;
        let remaining = self
            .custody_of(&token)
            .checked_sub(amount)
            .ok_or(EscrowError::AmountOverflow)?;
        let paid = self
            .balance_of(payee, &token)
            .checked_add(amount)
            .ok_or(EscrowError::AmountOverflow)?;

        if let Some(record) = self.escrows.get_mut(identifier) {
            record.claimed = true;
        }
        self.custody.insert(token.clone(), remaining);
        self.balances.insert((*payee, token.clone()), paid);
        if let Some(outstanding) = self.stats.total_escrowed.get_mut(&token) {
            *outstanding = outstanding.saturating_sub(amount);
        }
        Ok(amount)
    }

    // -- Administration -----------------------------------------------------

    /// Changes the publish fee. Existing escrows are unaffected.
    pub fn set_fee_rate(
        &mut self,
        caller: &Address,
        fee_bps: u32,
        now: u64,
    ) -> Result<LedgerEvent, EscrowError> {
        self.require_admin(caller)?;
        if fee_bps > MAX_FEE_BPS {
            return Err(EscrowError::FeeTooHigh(fee_bps));
        }
        self.fee.fee_bps = fee_bps;
        tracing::info!(fee_bps, "fee rate updated");
        Ok(self.emit(now, LedgerEventKind::FeeRateUpdated { fee_bps }))
    }

    pub fn set_fee_collector(
        &mut self,
        caller: &Address,
        collector: Address,
        now: u64,
    ) -> Result<LedgerEvent, EscrowError> {
        self.require_admin(caller)?;
        self.fee.collector = collector;
        tracing::info!(collector = %collector, "fee collector updated");
        Ok(self.emit(now, LedgerEventKind::FeeCollectorUpdated { collector }))
    }

    /// Sends tokens the contract holds but owes to no escrow to `to`.
    ///
    /// # Errors
    ///
    /// [`EscrowError::NotRecoverable`] if `amount` would dip into funds
    /// backing unsettled escrows.
    pub fn recover_assets(
        &mut self,
        caller: &Address,
        token: &Token,
        amount: Amount,
        to: &Address,
        now: u64,
    ) -> Result<LedgerEvent, EscrowError> {
        self.require_admin(caller)?;
        if amount == 0 {
            return Err(EscrowError::ZeroAmount);
        }
        let available = self.recoverable(token);
        if amount > available {
            return Err(EscrowError::NotRecoverable {
                requested: amount,
                available,
            });
        }
        self.balance_of(to, token)
            .checked_add(amount)
            .ok_or(EscrowError::AmountOverflow)?;

        let held = self.custody_of(token);
        self.custody.insert(token.clone(), held - amount);
        self.credit(to, token, amount)?;
        tracing::warn!(token = %token, amount = %amount, to = %to, "assets recovered");
        Ok(self.emit(
            now,
            LedgerEventKind::AssetsRecovered {
                token: token.clone(),
                amount,
                to: *to,
            },
        ))
    }

    fn require_admin(&self, caller: &Address) -> Result<(), EscrowError> {
        if *caller == self.admin {
            Ok(())
        } else {
            Err(EscrowError::NotAdmin)
        }
    }

    // -- Token movements outside the escrow flow ----------------------------

    /// Credits an account with tokens from outside the ledger.
    pub fn fund_account(
        &mut self,
        account: &Address,
        token: &Token,
        amount: Amount,
    ) -> Result<(), EscrowError> {
        self.credit(account, token, amount)
    }

    /// A plain token transfer to the contract that bypasses `publish`. The
    /// tokens land in custody without backing any escrow, which is what
    /// [`recover_assets`](Self::recover_assets) exists for.
    pub fn transfer_to_contract(
        &mut self,
        from: &Address,
        token: &Token,
        amount: Amount,
    ) -> Result<(), EscrowError> {
        self.custody_of(token)
            .checked_add(amount)
            .ok_or(EscrowError::AmountOverflow)?;
        self.debit(from, token, amount)?;
        *self.custody.entry(token.clone()).or_insert(0) += amount;
        Ok(())
    }

    fn debit(&mut self, account: &Address, token: &Token, amount: Amount) -> Result<(), EscrowError> {
        let available = self.balance_of(account, token);
        let remaining = available
            .checked_sub(amount)
            .ok_or(EscrowError::InsufficientBalance {
                needed: amount,
                available,
            })?;
        self.balances.insert((*account, token.clone()), remaining);
        Ok(())
    }

    fn credit(&mut self, account: &Address, token: &Token, amount: Amount) -> Result<(), EscrowError> {
        let balance = self
            .balance_of(account, token)
            .checked_add(amount)
            .ok_or(EscrowError::AmountOverflow)?;
        self.balances.insert((*account, token.clone()), balance);
        Ok(())
    }

    fn emit(&mut self, block_time: u64, kind: LedgerEventKind) -> LedgerEvent {
        let event = LedgerEvent {
            seq: self.events.len() as u64 + 1,
            block_time,
            kind,
        };
        self.events.push(event.clone());
        event
    }

    // -- Queries ------------------------------------------------------------

    pub fn record(&self, identifier: &TransferId) -> Option<&EscrowRecord> {
        self.escrows.get(identifier)
    }

    pub fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    pub fn balance_of(&self, account: &Address, token: &Token) -> Amount {
        self.balances
            .get(&(*account, token.clone()))
            .copied()
            .unwrap_or(0)
    }

    pub fn fee_config(&self) -> FeeConfig {
        self.fee
    }

    pub fn admin(&self) -> &Address {
        &self.admin
    }

    /// Everything the contract holds in `token`.
    pub fn custody_of(&self, token: &Token) -> Amount {
        self.custody.get(token).copied().unwrap_or(0)
    }

    /// Custody not owed to any unsettled escrow.
    pub fn recoverable(&self, token: &Token) -> Amount {
        let owed = self.stats.total_escrowed.get(token).copied().unwrap_or(0);
        self.custody_of(token).saturating_sub(owed)
    }

    /// Up to `limit` events with `seq > cursor`, oldest first.
    pub fn events_since(&self, cursor: u64, limit: usize) -> Vec<LedgerEvent> {
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(self.events.len());
        self.events[start..].iter().take(limit).cloned().collect()
    }

    /// Sequence number of the newest event, `0` before the first.
    pub fn last_seq(&self) -> u64 {
        self.events.len() as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_protocol::transfer::TokenRegistry;

    const T0: u64 = 1_700_000_000;

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    fn usdc() -> Token {
        TokenRegistry::default().resolve("USDC").unwrap()
    }

    fn id(b: u8) -> TransferId {
        TransferId::from_bytes([b; 32])
    }

    const ADMIN: u8 = 0xad;
    const COLLECTOR: u8 = 0xfe;
    const ALICE: u8 = 0xa1;
    const BOB: u8 = 0xb0;

    fn ledger(fee_bps: u32) -> EscrowLedger {
        let mut ledger = EscrowLedger::new(addr(ADMIN), fee_bps, addr(COLLECTOR)).unwrap();
        ledger.fund_account(&addr(ALICE), &usdc(), 1_000_000).unwrap();
        ledger
    }

    #[test]
    fn deploy_rejects_fee_above_cap() {
        assert_eq!(
            EscrowLedger::new(addr(ADMIN), MAX_FEE_BPS + 1, addr(COLLECTOR)).unwrap_err(),
            EscrowError::FeeTooHigh(MAX_FEE_BPS + 1)
        );
    }

    #[test]
    fn fee_is_floored() {
        let fee = FeeConfig {
            fee_bps: 50,
            collector: addr(COLLECTOR),
        };
        assert_eq!(fee.fee_for(10_000).unwrap(), 50);
        assert_eq!(fee.fee_for(199).unwrap(), 0);
        assert_eq!(fee.fee_for(201).unwrap(), 1);
        assert_eq!(fee.fee_for(Amount::MAX), Err(EscrowError::AmountOverflow));
    }

    #[test]
    fn publish_debits_sender_and_pays_collector() {
        let mut l = ledger(50);
        let event = l.publish(&addr(ALICE), &id(1), &usdc(), 10_000, T0).unwrap();

        assert_eq!(event.seq, 1);
        assert!(matches!(
            event.kind,
            LedgerEventKind::Published {
                net_amount: 9_950,
                fee: 50,
                ..
            }
        ));
        assert_eq!(l.balance_of(&addr(ALICE), &usdc()), 990_000);
        assert_eq!(l.balance_of(&addr(COLLECTOR), &usdc()), 50);
        assert_eq!(l.custody_of(&usdc()), 9_950);

        let record = l.record(&id(1)).unwrap();
        assert_eq!(record.amount, 9_950);
        assert_eq!(record.sender, addr(ALICE));
        assert!(!record.claimed);
    }

    #[test]
    fn publish_refusals_leave_state_untouched() {
        let mut l = ledger(50);
        assert_eq!(
            l.publish(&addr(ALICE), &id(1), &usdc(), 0, T0).unwrap_err(),
            EscrowError::ZeroAmount
        );
        assert!(matches!(
            l.publish(&addr(BOB), &id(1), &usdc(), 10, T0).unwrap_err(),
            EscrowError::InsufficientBalance { needed: 10, available: 0 }
        ));
        assert!(l.record(&id(1)).is_none());
        assert_eq!(l.last_seq(), 0);

        l.publish(&addr(ALICE), &id(1), &usdc(), 100, T0).unwrap();
        let before = l.record(&id(1)).cloned();
        assert_eq!(
            l.publish(&addr(ALICE), &id(1), &usdc(), 500, T0 + 1).unwrap_err(),
            EscrowError::AlreadyExists(id(1))
        );
        assert_eq!(l.record(&id(1)).cloned(), before);
        assert_eq!(l.balance_of(&addr(ALICE), &usdc()), 999_900);
    }

    #[test]
    fn claim_pays_any_holder_once() {
        let mut l = ledger(0);
        l.publish(&addr(ALICE), &id(2), &usdc(), 700, T0).unwrap();

        l.claim(&addr(BOB), &id(2), T0 + 5).unwrap();
        assert_eq!(l.balance_of(&addr(BOB), &usdc()), 700);
        assert_eq!(
            l.claim(&addr(BOB), &id(2), T0 + 6).unwrap_err(),
            EscrowError::AlreadyClaimed(id(2))
        );
        assert_eq!(l.balance_of(&addr(BOB), &usdc()), 700);
        assert_eq!(
            l.claim(&addr(BOB), &id(3), T0).unwrap_err(),
            EscrowError::NotFound(id(3))
        );
    }

    #[test]
    fn cancel_window_and_sender_checks() {
        let mut l = ledger(0);
        l.publish(&addr(ALICE), &id(4), &usdc(), 1_000, T0).unwrap();

        assert_eq!(
            l.cancel(&addr(ALICE), &id(4), T0 + CANCEL_WINDOW_SECS - 1)
                .unwrap_err(),
            EscrowError::TooEarly {
                identifier: id(4),
                available_at: T0 + CANCEL_WINDOW_SECS
            }
        );
        assert_eq!(
            l.cancel(&addr(BOB), &id(4), T0 + CANCEL_WINDOW_SECS)
                .unwrap_err(),
            EscrowError::NotSender(id(4))
        );

        l.cancel(&addr(ALICE), &id(4), T0 + CANCEL_WINDOW_SECS)
            .unwrap();
        assert_eq!(l.balance_of(&addr(ALICE), &usdc()), 1_000_000);
        assert_eq!(
            l.claim(&addr(BOB), &id(4), T0 + CANCEL_WINDOW_SECS).unwrap_err(),
            EscrowError::AlreadyClaimed(id(4))
        );
        assert_eq!(l.stats().cancelled, 1);
    }

    /// Everything a refused call must leave alone.
    fn snapshot(l: &EscrowLedger, identifier: &TransferId) -> (Option<EscrowRecord>, Amount, Amount, Amount, u64) {
        (
            l.record(identifier).cloned(),
            l.custody_of(&usdc()),
            l.balance_of(&addr(ALICE), &usdc()),
            l.balance_of(&addr(BOB), &usdc()),
            l.last_seq(),
        )
    }

    #[test]
    fn claim_refusals_leave_state_untouched() {
        let mut l = ledger(0);
        l.publish(&addr(ALICE), &id(10), &usdc(), 1_000, T0).unwrap();

        let before = snapshot(&l, &id(11));
        assert_eq!(
            l.claim(&addr(BOB), &id(11), T0).unwrap_err(),
            EscrowError::NotFound(id(11))
        );
        assert_eq!(snapshot(&l, &id(11)), before);

        // A claimer whose balance cannot absorb the payout.
        l.fund_account(&addr(BOB), &usdc(), Amount::MAX).unwrap();
        let before = snapshot(&l, &id(10));
        assert_eq!(
            l.claim(&addr(BOB), &id(10), T0 + 1).unwrap_err(),
            EscrowError::AmountOverflow
        );
        assert_eq!(snapshot(&l, &id(10)), before);
        assert!(!l.record(&id(10)).unwrap().claimed);
        assert_eq!(l.stats().claimed, 0);

        // The escrow is still live: its sender can take it back.
        l.cancel(&addr(ALICE), &id(10), T0 + CANCEL_WINDOW_SECS)
            .unwrap();
        assert_eq!(l.balance_of(&addr(ALICE), &usdc()), 1_000_000);

        let before = snapshot(&l, &id(10));
        assert_eq!(
            l.claim(&addr(ALICE), &id(10), T0 + CANCEL_WINDOW_SECS).unwrap_err(),
            EscrowError::AlreadyClaimed(id(10))
        );
        assert_eq!(snapshot(&l, &id(10)), before);
    }

    #[test]
    fn cancel_refusals_leave_state_untouched() {
        let mut l = ledger(0);
        l.publish(&addr(ALICE), &id(12), &usdc(), 1_000, T0).unwrap();
        let open = T0 + CANCEL_WINDOW_SECS;

        let before = snapshot(&l, &id(13));
        assert_eq!(
            l.cancel(&addr(ALICE), &id(13), open).unwrap_err(),
            EscrowError::NotFound(id(13))
        );
        assert_eq!(snapshot(&l, &id(13)), before);

        let before = snapshot(&l, &id(12));
        assert!(matches!(
            l.cancel(&addr(ALICE), &id(12), open - 1).unwrap_err(),
            EscrowError::TooEarly { .. }
        ));
        assert_eq!(
            l.cancel(&addr(BOB), &id(12), open).unwrap_err(),
            EscrowError::NotSender(id(12))
        );
        assert_eq!(snapshot(&l, &id(12)), before);

        l.claim(&addr(BOB), &id(12), T0 + 1).unwrap();
        let before = snapshot(&l, &id(12));
        assert_eq!(
            l.cancel(&addr(ALICE), &id(12), open).unwrap_err(),
            EscrowError::AlreadyClaimed(id(12))
        );
        assert_eq!(snapshot(&l, &id(12)), before);
    }

    #[test]
    fn cancel_by_stranger_is_not_sender_at_any_time() {
        let mut l = ledger(0);
        l.publish(&addr(ALICE), &id(14), &usdc(), 50, T0).unwrap();

        for now in [T0, T0 + CANCEL_WINDOW_SECS] {
            assert_eq!(
                l.cancel(&addr(BOB), &id(14), now).unwrap_err(),
                EscrowError::NotSender(id(14))
            );
        }
        l.claim(&addr(BOB), &id(14), T0 + 1).unwrap();
        assert_eq!(
            l.cancel(&addr(BOB), &id(14), T0 + CANCEL_WINDOW_SECS)
                .unwrap_err(),
            EscrowError::NotSender(id(14))
        );
    }

    #[test]
    fn stats_track_outstanding_and_fees() {
        let mut l = ledger(100);
        l.publish(&addr(ALICE), &id(5), &usdc(), 10_000, T0).unwrap();
        l.publish(&addr(ALICE), &id(6), &usdc(), 20_000, T0).unwrap();
        l.claim(&addr(BOB), &id(5), T0).unwrap();

        let stats = l.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.total_escrowed.get(&usdc()), Some(&19_800));
        assert_eq!(stats.total_fees.get(&usdc()), Some(&300));
    }

    #[test]
    fn admin_operations_are_gated() {
        let mut l = ledger(50);
        assert_eq!(
            l.set_fee_rate(&addr(ALICE), 10, T0).unwrap_err(),
            EscrowError::NotAdmin
        );
        assert_eq!(
            l.set_fee_rate(&addr(ADMIN), MAX_FEE_BPS + 1, T0).unwrap_err(),
            EscrowError::FeeTooHigh(MAX_FEE_BPS + 1)
        );
        l.set_fee_rate(&addr(ADMIN), MAX_FEE_BPS, T0).unwrap();
        assert_eq!(l.fee_config().fee_bps, MAX_FEE_BPS);

        assert_eq!(
            l.set_fee_collector(&addr(BOB), addr(BOB), T0).unwrap_err(),
            EscrowError::NotAdmin
        );
        let event = l.set_fee_collector(&addr(ADMIN), addr(BOB), T0).unwrap();
        assert_eq!(
            event.kind,
            LedgerEventKind::FeeCollectorUpdated { collector: addr(BOB) }
        );
        assert_eq!(l.fee_config().collector, addr(BOB));
    }

    #[test]
    fn recovery_never_touches_escrowed_funds() {
        let mut l = ledger(0);
        l.publish(&addr(ALICE), &id(7), &usdc(), 5_000, T0).unwrap();
        l.transfer_to_contract(&addr(ALICE), &usdc(), 300).unwrap();
        assert_eq!(l.recoverable(&usdc()), 300);

        assert_eq!(
            l.recover_assets(&addr(ALICE), &usdc(), 1, &addr(ALICE), T0)
                .unwrap_err(),
            EscrowError::NotAdmin
        );
        assert_eq!(
            l.recover_assets(&addr(ADMIN), &usdc(), 301, &addr(ADMIN), T0)
                .unwrap_err(),
            EscrowError::NotRecoverable {
                requested: 301,
                available: 300
            }
        );
        l.recover_assets(&addr(ADMIN), &usdc(), 300, &addr(ADMIN), T0)
            .unwrap();
        assert_eq!(l.balance_of(&addr(ADMIN), &usdc()), 300);
        assert_eq!(l.custody_of(&usdc()), 5_000);

        // The escrow still pays out in full.
        l.claim(&addr(BOB), &id(7), T0).unwrap();
        assert_eq!(l.balance_of(&addr(BOB), &usdc()), 5_000);
    }

    #[test]
    fn event_log_is_ordered_and_pageable() {
        let mut l = ledger(0);
        for b in 1..=5 {
            l.publish(&addr(ALICE), &id(b), &usdc(), 10, T0 + b as u64)
                .unwrap();
        }
        let page = l.events_since(0, 2);
        assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        let rest = l.events_since(2, 100);
        assert_eq!(rest.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert!(l.events_since(5, 10).is_empty());
        assert!(l.events_since(99, 10).is_empty());
    }

    #[test]
    fn execute_dispatches_calls() {
        let mut l = ledger(0);
        let call = LedgerCall::Publish {
            identifier: id(9),
            token: usdc(),
            amount: 10,
        };
        l.execute(&addr(ALICE), &call, T0).unwrap();
        l.execute(&addr(BOB), &LedgerCall::Claim { identifier: id(9) }, T0)
            .unwrap();
        assert!(l.record(&id(9)).unwrap().claimed);
    }
}
