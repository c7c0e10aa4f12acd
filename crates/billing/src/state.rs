//! Billing entry and its state machine
//!
//! Eight states, one legal transition table. Anything off the table is a
//! structured error naming the current state and the attempted target.

use chrono::{DateTime, Utc};
use meridian_core::{AccountId, BillingEntryId, CorrelationId, MicroUsd};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingState {
    Idle,
    ReserveHeld,
    Committed,
    FinalizePending,
    FinalizeAcked,
    FinalizeFailed,
    Released,
    Voided,
}

impl BillingState {
    /// Terminal states reject all further operations.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::FinalizeAcked | Self::Released | Self::Voided
        )
    }

    /// The legal transition table. Everything else is rejected.
    pub fn can_transition_to(&self, target: BillingState) -> bool {
        use BillingState::*;
        matches!(
            (self, target),
            (Idle, ReserveHeld)
                | (ReserveHeld, FinalizePending)
                | (ReserveHeld, Released)
                | (FinalizePending, FinalizeAcked)
                | (FinalizePending, FinalizeFailed)
                | (FinalizeFailed, FinalizeAcked)
                | (FinalizeFailed, Voided)
                | (Committed, Voided)
        )
    }
}

impl std::fmt::Display for BillingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::ReserveHeld => "RESERVE_HELD",
            Self::Committed => "COMMITTED",
            Self::FinalizePending => "FINALIZE_PENDING",
            Self::FinalizeAcked => "FINALIZE_ACKED",
            Self::FinalizeFailed => "FINALIZE_FAILED",
            Self::Released => "RELEASED",
            Self::Voided => "VOIDED",
        };
        f.write_str(s)
    }
}

/// The state machine's subject: one reservation's financial lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEntry {
    pub billing_entry_id: BillingEntryId,
    pub correlation_id: CorrelationId,
    pub state: BillingState,
    pub account_id: AccountId,
    pub estimated_cost: MicroUsd,
    /// Null until commit posts the actual.
    pub actual_cost: Option<MicroUsd>,
    /// Frozen at reserve for the entry's whole lifetime.
    pub exchange_rate_snapshot: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub wal_offset: u64,
    /// Monotonically non-decreasing remote-settlement retry count.
    pub finalize_attempts: u32,
    /// Reason recorded when the reservation was released, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_reason: Option<String>,
}
