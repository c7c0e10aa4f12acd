use crate::types::Rejection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("No binding for agent: {0}")]
    BindingNotFound(String),

    #[error("Binding for agent {agent} is invalid: {detail}")]
    BindingInvalid { agent: String, detail: String },

    #[error("Model {candidate} lacks required capability {capability}")]
    CapabilityMismatch {
        candidate: String,
        capability: String,
    },

    #[error("Agent requires the native runtime but {candidate} is served by provider type {provider_type}")]
    NativeRuntimeRequired {
        candidate: String,
        provider_type: String,
    },

    #[error("No provider available for agent {agent}: {} candidates rejected", rejections.len())]
    ProviderUnavailable {
        agent: String,
        rejections: Vec<Rejection>,
    },

    #[error("Routing configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("Pool {pool} not authorized for tenant {tenant}")]
    PoolUnauthorized { pool: String, tenant: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("BYOK proxy unavailable for tenant {0}")]
    ByokProxyUnavailable(String),

    #[error("Rate limited on {0}")]
    RateLimited(String),

    #[error("Budget exceeded for scope {0}")]
    BudgetExceeded(String),

    #[error("Ledger write path unhealthy; refusing new dispatches")]
    BudgetCircuitOpen,

    #[error("Context window utilization {used_pct}% exceeds the hard ceiling")]
    ContextOverflow { used_pct: u32 },

    #[error("Tool loop exceeded max iterations ({0})")]
    ToolCallMaxIterations(u32),

    #[error("Tool loop exceeded max total tool calls ({0})")]
    ToolCallLimitExceeded(u32),

    #[error("Tool loop exceeded wall time ({0:?})")]
    ToolCallWallTimeExceeded(std::time::Duration),

    #[error("Tool loop aborted after {0} consecutive tool failures")]
    ToolCallConsecutiveFailures(u32),

    #[error(transparent)]
    Provider(#[from] meridian_providers::ProviderError),

    #[error(transparent)]
    Billing(#[from] meridian_billing::BillingError),

    #[error(transparent)]
    Pricing(#[from] meridian_core::PricingError),

    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RouterError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BindingNotFound(_) => "BINDING_NOT_FOUND",
            Self::BindingInvalid { .. } => "BINDING_INVALID",
            Self::CapabilityMismatch { .. } => "CAPABILITY_MISMATCH",
            Self::NativeRuntimeRequired { .. } => "NATIVE_RUNTIME_REQUIRED",
            Self::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            Self::ConfigInvalid(_) => "CONFIG_INVALID",
            Self::PoolUnauthorized { .. } => "POOL_UNAUTHORIZED",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::ByokProxyUnavailable(_) => "BYOK_PROXY_UNAVAILABLE",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Self::BudgetCircuitOpen => "BUDGET_CIRCUIT_OPEN",
            Self::ContextOverflow { .. } => "CONTEXT_OVERFLOW",
            Self::ToolCallMaxIterations(_) => "TOOL_CALL_MAX_ITERATIONS",
            Self::ToolCallLimitExceeded(_) => "TOOL_CALL_LIMIT_EXCEEDED",
            Self::ToolCallWallTimeExceeded(_) => "TOOL_CALL_WALL_TIME_EXCEEDED",
            Self::ToolCallConsecutiveFailures(_) => "TOOL_CALL_CONSECUTIVE_FAILURES",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::Billing(e) => e.code(),
            Self::Pricing(_) => "CONFIG_INVALID",
            Self::Database(_) => "ROUTER_STORE_UNAVAILABLE",
            Self::Other(_) => "ROUTER_INTERNAL",
        }
    }

    /// Retryable from the caller's point of view.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::BudgetCircuitOpen | Self::ProviderUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
