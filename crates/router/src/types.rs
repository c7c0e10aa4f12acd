use chrono::{DateTime, Utc};
use meridian_core::{AccountId, PoolId, PricingEntry};
use meridian_providers::ProviderType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a model target supports / what a binding demands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub native_runtime: bool,
    #[serde(default)]
    pub tool_calling: bool,
    #[serde(default)]
    pub thinking_traces: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub streaming: bool,
}

impl CapabilitySet {
    /// Does a target supporting `self` satisfy `required`?
    /// `native_runtime` is checked separately against the provider type.
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        (!required.tool_calling || self.tool_calling)
            && (!required.thinking_traces || self.thinking_traces)
            && (!required.vision || self.vision)
            && (!required.streaming || self.streaming)
    }

    /// The first capability `self` lacks, for rejection messages.
    pub fn first_missing(&self, required: &CapabilitySet) -> Option<&'static str> {
        if required.tool_calling && !self.tool_calling {
            return Some("tool_calling");
        }
        if required.thinking_traces && !self.thinking_traces {
            return Some("thinking_traces");
        }
        if required.vision && !self.vision {
            return Some("vision");
        }
        if required.streaming && !self.streaming {
            return Some("streaming");
        }
        None
    }
}

/// Maps an external agent identity onto a model alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentBinding {
    pub agent: String,
    pub model_alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_ref: Option<String>,
    #[serde(default)]
    pub requires: CapabilitySet,
}

impl AgentBinding {
    pub fn new(agent: &str, model_alias: &str) -> Self {
        Self {
            agent: agent.to_string(),
            model_alias: model_alias.to_string(),
            temperature: None,
            persona_ref: None,
            requires: CapabilitySet::default(),
        }
    }

    pub fn requires(mut self, requires: CapabilitySet) -> Self {
        self.requires = requires;
        self
    }
}

/// One concrete model an alias can resolve to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
    pub capabilities: CapabilitySet,
}

impl ModelTarget {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// Authorization-granular bundle of provider+model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub provider: String,
    pub model: String,
    /// Tiers whose tenants may default into this pool.
    #[serde(default)]
    pub tier_access: Vec<String>,
}

/// Validated tenant claims relevant to routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: AccountId,
    pub authorized_pools: Vec<PoolId>,
    /// Preferred pool per task type.
    #[serde(default)]
    pub task_preferences: HashMap<String, PoolId>,
    pub tier: String,
}

impl TenantContext {
    pub fn is_authorized(&self, pool: &PoolId) -> bool {
        self.authorized_pools.contains(pool)
    }
}

/// The resolver's product: an executable provider+model plus pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub provider: String,
    pub model_id: String,
    pub provider_type: ProviderType,
    pub pricing: PricingEntry,
}

impl ResolvedModel {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model_id)
    }
}

/// One candidate the chain walker turned down, and why. These surface
/// verbatim in PROVIDER_UNAVAILABLE errors for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub candidate: String,
    pub reason: String,
}

/// Log of a routing decision and execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingLog {
    #[serde(skip)]
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub tenant: Option<String>,
    pub pool: Option<String>,
    pub selected_model: String,
    pub downgraded: bool,
    pub fell_back: bool,
    pub rejections: Vec<Rejection>,
    pub cost_micro: Option<i64>,
    pub is_critical: bool,
}
