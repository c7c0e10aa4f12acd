//! The billing state machine
//!
//! Drives a `BillingEntry` through its lifecycle. Every transition lands
//! in the WAL before any state mutates: ledger-backed transitions get
//! their WAL record from the ledger append itself, pure state
//! transitions write their own envelope.

use crate::error::{BillingError, Result};
use crate::state::{BillingEntry, BillingState};
use chrono::Utc;
use meridian_core::{AccountId, AccountKey, BillingEntryId, CorrelationId, MicroUsd};
use meridian_ledger::types::{EventType, LedgerEntry};
use meridian_ledger::wal::WalEnvelope;
use meridian_ledger::{postings, Ledger};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{info, warn};

const TABLE_BILLING: &str = "billing_entries";

pub struct BillingMachine {
    db: Surreal<Any>,
    ledger: Arc<Ledger>,
}

impl BillingMachine {
    pub fn new(db: Surreal<Any>, ledger: Arc<Ledger>) -> Self {
        Self { db, ledger }
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Inject spendable funds onto an account.
    pub async fn mint(&self, account: &AccountId, amount: MicroUsd) -> Result<()> {
        let amount = amount.require_non_negative().map_err(anyhow::Error::from)?;
        let entry = LedgerEntry::new(
            BillingEntryId::generate(),
            EventType::Mint,
            CorrelationId::random(),
            postings::mint(account, amount),
        );
        self.ledger.append_entry(entry).await?;
        Ok(())
    }

    /// IDLE → RESERVE_HELD. Freezes the exchange-rate snapshot and holds
    /// the estimate against the account.
    pub async fn reserve(
        &self,
        account: &AccountId,
        estimated: MicroUsd,
        correlation_id: CorrelationId,
        exchange_rate: Decimal,
    ) -> Result<BillingEntry> {
        let estimated = estimated
            .require_non_negative()
            .map_err(anyhow::Error::from)?;

        let available = self
            .ledger
            .derive_balance(&AccountKey::available(account));
        if available < estimated {
            return Err(BillingError::InsufficientFunds {
                account: account.to_string(),
                available: available.get(),
                requested: estimated.get(),
            });
        }

        let billing_entry_id = BillingEntryId::generate();
        let ledger_entry = LedgerEntry::new(
            billing_entry_id.clone(),
            EventType::Reserve,
            correlation_id.clone(),
            postings::reserve(account, estimated),
        )
        .with_exchange_rate(exchange_rate);

        let outcome = self.ledger.append_entry(ledger_entry).await?;
        let wal_offset = match outcome {
            meridian_ledger::AppendOutcome::Appended(offset) => offset,
            meridian_ledger::AppendOutcome::Duplicate => 0,
        };

        let now = Utc::now();
        let entry = BillingEntry {
            billing_entry_id: billing_entry_id.clone(),
            correlation_id,
            state: BillingState::ReserveHeld,
            account_id: account.clone(),
            estimated_cost: estimated,
            actual_cost: None,
            exchange_rate_snapshot: exchange_rate,
            created_at: now,
            updated_at: now,
            wal_offset,
            finalize_attempts: 0,
            release_reason: None,
        };

        let _: Option<BillingEntry> = self
            .db
            .create((TABLE_BILLING, billing_entry_id.to_string()))
            .content(entry.clone())
            .await?;

        info!(entry = %billing_entry_id, account = %account, estimated = %estimated, "Reservation held");
        Ok(entry)
    }

    /// RESERVE_HELD → FINALIZE_PENDING. Posts the commit against the
    /// ledger with the actual cost.
    ///
    /// A caller supplying an exchange rate different from the frozen
    /// snapshot is rejected: the snapshot is immutable for the entry's
    /// lifetime.
    pub async fn commit(
        &self,
        billing_entry_id: &BillingEntryId,
        actual: MicroUsd,
        exchange_rate: Option<Decimal>,
    ) -> Result<BillingEntry> {
        let actual = actual.require_non_negative().map_err(anyhow::Error::from)?;
        let mut entry = self.must_get(billing_entry_id).await?;
        self.check_transition(&entry, BillingState::FinalizePending)?;

        if let Some(rate) = exchange_rate {
            if rate != entry.exchange_rate_snapshot {
                return Err(BillingError::ExchangeRateFrozen {
                    entry: billing_entry_id.to_string(),
                });
            }
        }

        let ledger_entry = LedgerEntry::new(
            billing_entry_id.clone(),
            EventType::Commit,
            entry.correlation_id.clone(),
            postings::commit(&entry.account_id, entry.estimated_cost, actual),
        )
        .with_exchange_rate(entry.exchange_rate_snapshot);
        self.ledger.append_entry(ledger_entry).await?;

        entry.state = BillingState::FinalizePending;
        entry.actual_cost = Some(actual);
        entry.updated_at = Utc::now();
        self.persist(&entry).await?;

        info!(entry = %billing_entry_id, actual = %actual, "Commit posted, finalize pending");
        Ok(entry)
    }

    /// RESERVE_HELD → RELEASED. Pre-stream failure, user cancel, or
    /// reserve expiry.
    pub async fn release(
        &self,
        billing_entry_id: &BillingEntryId,
        reason: &str,
    ) -> Result<BillingEntry> {
        let mut entry = self.must_get(billing_entry_id).await?;
        self.check_transition(&entry, BillingState::Released)?;

        let ledger_entry = LedgerEntry::new(
            billing_entry_id.clone(),
            EventType::Release,
            entry.correlation_id.clone(),
            postings::release(&entry.account_id, entry.estimated_cost),
        );
        self.ledger.append_entry(ledger_entry).await?;

        entry.state = BillingState::Released;
        entry.release_reason = Some(reason.to_string());
        entry.updated_at = Utc::now();
        self.persist(&entry).await?;

        info!(entry = %billing_entry_id, reason = %reason, "Reservation released");
        Ok(entry)
    }

    /// FINALIZE_PENDING → FINALIZE_ACKED: remote settlement succeeded.
    pub async fn mark_finalize_acked(
        &self,
        billing_entry_id: &BillingEntryId,
    ) -> Result<BillingEntry> {
        self.pure_transition(billing_entry_id, BillingState::FinalizeAcked, "finalize_acked")
            .await
    }

    /// FINALIZE_PENDING → FINALIZE_FAILED: retries exhausted.
    pub async fn mark_finalize_failed(
        &self,
        billing_entry_id: &BillingEntryId,
    ) -> Result<BillingEntry> {
        self.pure_transition(billing_entry_id, BillingState::FinalizeFailed, "finalize_failed")
            .await
    }

    /// FINALIZE_FAILED → FINALIZE_ACKED: operator confirmed settlement
    /// out of band.
    pub async fn manual_finalize(
        &self,
        billing_entry_id: &BillingEntryId,
    ) -> Result<BillingEntry> {
        let entry = self.must_get(billing_entry_id).await?;
        if entry.state != BillingState::FinalizeFailed {
            return Err(self.transition_error(&entry, BillingState::FinalizeAcked));
        }
        self.pure_transition(billing_entry_id, BillingState::FinalizeAcked, "manual_finalize")
            .await
    }

    /// Operator reversal: FINALIZE_FAILED or COMMITTED → VOIDED, undoing
    /// the committed revenue.
    pub async fn operator_void(
        &self,
        billing_entry_id: &BillingEntryId,
        reason: &str,
    ) -> Result<BillingEntry> {
        let mut entry = self.must_get(billing_entry_id).await?;
        self.check_transition(&entry, BillingState::Voided)?;

        if let Some(actual) = entry.actual_cost {
            let ledger_entry = LedgerEntry::new(
                billing_entry_id.clone(),
                EventType::Void,
                entry.correlation_id.clone(),
                postings::void(&entry.account_id, actual),
            );
            self.ledger.append_entry(ledger_entry).await?;
        }

        entry.state = BillingState::Voided;
        entry.updated_at = Utc::now();
        self.persist(&entry).await?;

        warn!(entry = %billing_entry_id, reason = %reason, "Entry voided by operator");
        Ok(entry)
    }

    /// Bump the finalize attempt counter (monotonic).
    pub async fn record_finalize_attempt(
        &self,
        billing_entry_id: &BillingEntryId,
    ) -> Result<u32> {
        let mut entry = self.must_get(billing_entry_id).await?;
        if entry.state.is_terminal() {
            return Err(BillingError::TerminalState {
                entry: entry.billing_entry_id.to_string(),
                state: entry.state,
            });
        }
        entry.finalize_attempts += 1;
        entry.updated_at = Utc::now();
        self.persist(&entry).await?;
        Ok(entry.finalize_attempts)
    }

    pub async fn get(&self, billing_entry_id: &BillingEntryId) -> Result<Option<BillingEntry>> {
        let entry: Option<BillingEntry> = self
            .db
            .select((TABLE_BILLING, billing_entry_id.to_string()))
            .await?;
        Ok(entry)
    }

    /// Count of entries stuck in FINALIZE_PENDING; feeds the breaker's
    /// reconciliation guard.
    pub async fn pending_reconciliation_count(&self) -> Result<usize> {
        let entries: Vec<BillingEntry> = self.db.select(TABLE_BILLING).await?;
        Ok(entries
            .iter()
            .filter(|e| e.state == BillingState::FinalizePending)
            .count())
    }

    /// Reservations still held past their TTL; released at startup.
    pub async fn reconcile_expired_reserves(
        &self,
        max_age: chrono::Duration,
    ) -> Result<Vec<BillingEntryId>> {
        let entries: Vec<BillingEntry> = self.db.select(TABLE_BILLING).await?;
        let cutoff = Utc::now() - max_age;
        let mut released = Vec::new();
        for entry in entries {
            if entry.state == BillingState::ReserveHeld && entry.created_at < cutoff {
                self.release(&entry.billing_entry_id, "reserve_expired").await?;
                released.push(entry.billing_entry_id);
            }
        }
        Ok(released)
    }

    // -- internals --

    async fn must_get(&self, billing_entry_id: &BillingEntryId) -> Result<BillingEntry> {
        self.get(billing_entry_id)
            .await?
            .ok_or_else(|| BillingError::EntryNotFound(billing_entry_id.to_string()))
    }

    fn check_transition(&self, entry: &BillingEntry, target: BillingState) -> Result<()> {
        // Terminal states have no outgoing edges, so the table alone
        // rejects them; the error still names current and attempted.
        if !entry.state.can_transition_to(target) {
            return Err(self.transition_error(entry, target));
        }
        Ok(())
    }

    fn transition_error(&self, entry: &BillingEntry, target: BillingState) -> BillingError {
        BillingError::InvalidTransition {
            entry: entry.billing_entry_id.to_string(),
            current: entry.state,
            attempted: target,
        }
    }

    /// State-only transition: WAL envelope first, then the entry record.
    async fn pure_transition(
        &self,
        billing_entry_id: &BillingEntryId,
        target: BillingState,
        event_type: &str,
    ) -> Result<BillingEntry> {
        let mut entry = self.must_get(billing_entry_id).await?;
        self.check_transition(&entry, target)?;

        let envelope = WalEnvelope::new(
            event_type,
            billing_entry_id.clone(),
            entry.correlation_id.clone(),
            json!({
                "from": entry.state.to_string(),
                "to": target.to_string(),
            }),
        )
        .map_err(BillingError::Ledger)?;
        let offset = self.ledger.wal().append(envelope).await.map_err(BillingError::Ledger)?;

        entry.state = target;
        entry.wal_offset = offset;
        entry.updated_at = Utc::now();
        self.persist(&entry).await?;

        info!(entry = %billing_entry_id, state = %target, "Billing state advanced");
        Ok(entry)
    }

    async fn persist(&self, entry: &BillingEntry) -> Result<()> {
        let _: Option<BillingEntry> = self
            .db
            .update((TABLE_BILLING, entry.billing_entry_id.to_string()))
            .content(entry.clone())
            .await?;
        Ok(())
    }
}
