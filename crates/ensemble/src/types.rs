use meridian_core::{MicroUsd, PoolId, PricingEntry, Usage};
use meridian_providers::{ProviderAdapter, ProviderResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    #[error("All ensemble branches failed: {summary}")]
    AllBranchesFailed { summary: String },

    #[error("Ensemble budget exceeded: spent {spent} of {budget}")]
    BudgetExceeded { spent: i64, budget: i64 },

    #[error("Ensemble timed out after {0:?}")]
    Timeout(Duration),

    #[error("Ensemble cancelled by caller")]
    Cancelled,

    #[error("Ensemble misconfigured: {0}")]
    Config(String),
}

impl EnsembleError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllBranchesFailed { .. } => "ENSEMBLE_ALL_FAILED",
            Self::BudgetExceeded { .. } => "ENSEMBLE_BUDGET_EXCEEDED",
            Self::Timeout(_) => "ENSEMBLE_TIMEOUT",
            Self::Cancelled => "ENSEMBLE_CANCELLED",
            Self::Config(_) => "CONFIG_INVALID",
        }
    }
}

pub type Result<T> = std::result::Result<T, EnsembleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    FirstComplete,
    BestOfN,
    Consensus,
}

#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    pub strategy: MergeStrategy,
    pub per_model_budget: MicroUsd,
    pub total_budget: MicroUsd,
    pub per_branch_timeout: Duration,
    pub total_timeout: Duration,
}

impl EnsembleConfig {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            per_model_budget: MicroUsd::new(50_000),
            total_budget: MicroUsd::new(150_000),
            per_branch_timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(90),
        }
    }
}

/// One branch of the fan-out: a pool resolved to its adapter and price.
#[derive(Clone)]
pub struct BranchSpec {
    pub pool_id: PoolId,
    pub provider: String,
    pub model: String,
    pub pricing: PricingEntry,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl BranchSpec {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// Per-branch outcome. Exactly one of `result` / `error` is set, except
/// for branches that exceeded their cap, where the result is discarded
/// and both the error and the cost remain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchReport {
    pub pool_id: PoolId,
    pub model: String,
    pub result: Option<ProviderResponse>,
    pub error: Option<String>,
    /// Cost recorded even for failed or over-cap branches.
    pub cost_micro: MicroUsd,
    pub cancelled: bool,
}

/// The merged product of one ensemble run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleResult {
    /// Groups each branch's settlement record.
    pub ensemble_id: String,
    pub content: String,
    /// Model identity; names every contributor under consensus.
    pub model: String,
    pub usage: Usage,
    pub total_cost_micro: MicroUsd,
    pub all_results: Vec<BranchReport>,
}
