//! Meridian Core - Shared vocabulary for the model gateway
//!
//! Identifiers, money, account keys, pricing, canonical JSON and the
//! environment configuration every other crate builds on.

pub mod accounts;
pub mod canonical;
pub mod config;
pub mod ids;
pub mod money;
pub mod pricing;

pub use accounts::AccountKey;
pub use ids::{AccountId, BillingEntryId, CorrelationId, IdError, PoolId, TraceId};
pub use money::{MicroUsd, MoneyError};
pub use pricing::{PricingEntry, PricingError, PricingTable, Usage};
