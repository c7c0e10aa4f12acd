use crate::state::BillingState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Illegal billing transition for {entry}: {current:?} -> {attempted:?}")]
    InvalidTransition {
        entry: String,
        current: BillingState,
        attempted: BillingState,
    },

    #[error("Billing entry {entry} is terminal in state {state:?}; no further operations")]
    TerminalState { entry: String, state: BillingState },

    #[error("Billing entry not found: {0}")]
    EntryNotFound(String),

    #[error("Exchange-rate snapshot for {entry} is frozen; modification rejected")]
    ExchangeRateFrozen { entry: String },

    #[error("Insufficient funds for {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: String,
        available: i64,
        requested: i64,
    },

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Ledger(#[from] meridian_ledger::error::LedgerError),

    #[error(transparent)]
    Dlq(#[from] meridian_dlq::DlqError),

    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BillingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } | Self::TerminalState { .. } => "BILLING_STATE_INVALID",
            Self::EntryNotFound(_) => "BILLING_ENTRY_NOT_FOUND",
            Self::ExchangeRateFrozen { .. } => "EXCHANGE_RATE_FROZEN",
            Self::InsufficientFunds { .. } => "BUDGET_EXCEEDED",
            Self::Budget(e) => e.code(),
            Self::Protocol(e) => e.code(),
            Self::Ledger(e) => e.code(),
            Self::Dlq(_) => "DLQ_UNAVAILABLE",
            Self::Database(_) => "BILLING_STORE_UNAVAILABLE",
            Self::Serialization(_) | Self::Other(_) => "BILLING_INTERNAL",
        }
    }
}

#[derive(Error, Debug)]
pub enum BudgetError {
    #[error("Budget store unreachable for scope {scope}: {detail}")]
    Unavailable { scope: String, detail: String },

    #[error("Budget exceeded for scope {scope}")]
    Exceeded { scope: String },

    #[error("Budget delta must be a non-negative integer, got {0}")]
    NegativeDelta(i64),
}

impl BudgetError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "BUDGET_UNAVAILABLE",
            Self::Exceeded { .. } => "BUDGET_EXCEEDED",
            Self::NegativeDelta(_) => "BUDGET_DELTA_INVALID",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Settlement protocol incompatible: local {local}, remote {remote}")]
    Incompatible { local: u32, remote: u32 },

    #[error("Settlement service unreachable: {0}")]
    Unreachable(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Incompatible { .. } => "PROTOCOL_INCOMPATIBLE",
            Self::Unreachable(_) => "PROTOCOL_UNREACHABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
