use chrono::{DateTime, Utc};
use meridian_core::{AccountKey, BillingEntryId, CorrelationId, MicroUsd};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Financial event a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Supply injection onto a user account.
    Mint,
    /// Funds moved from available to held.
    Reserve,
    /// Held funds settled against actual cost.
    Commit,
    /// Reservation returned untouched.
    Release,
    /// Administrative reversal of a commit.
    Void,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::Reserve => "reserve",
            Self::Commit => "commit",
            Self::Release => "release",
            Self::Void => "void",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way a denomination conversion was rounded on a posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    Up,
    Down,
}

/// The sole accounting denomination.
pub const DENOM_MICRO_USD: &str = "uusd";

/// One signed delta against one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub account: AccountKey,
    pub delta: MicroUsd,
    pub denom: String,
    /// Recorded only when this posting converted denominations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounding: Option<Rounding>,
}

impl Posting {
    pub fn micro_usd(account: AccountKey, delta: MicroUsd) -> Self {
        Self {
            account,
            delta,
            denom: DENOM_MICRO_USD.to_string(),
            rounding: None,
        }
    }
}

/// Immutable double-entry record. Append-only forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub billing_entry_id: BillingEntryId,
    pub event_type: EventType,
    pub correlation_id: CorrelationId,
    pub postings: Vec<Posting>,
    /// Frozen exchange-rate snapshot, carried when the event priced a
    /// foreign denomination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<Decimal>,
    /// Assigned by the ledger at append time.
    pub wal_offset: u64,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        billing_entry_id: BillingEntryId,
        event_type: EventType,
        correlation_id: CorrelationId,
        postings: Vec<Posting>,
    ) -> Self {
        Self {
            billing_entry_id,
            event_type,
            correlation_id,
            postings,
            exchange_rate: None,
            wal_offset: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_exchange_rate(mut self, rate: Decimal) -> Self {
        self.exchange_rate = Some(rate);
        self
    }

    /// Dedup key: one billing entry emits at most one entry per event type.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.billing_entry_id, self.event_type)
    }
}
