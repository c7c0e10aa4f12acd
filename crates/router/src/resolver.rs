//! Agent → model resolution
//!
//! Resolution order: alias lookup, capability compatibility, native
//! runtime enforcement, budget downgrade, health fallback. Chain walks
//! share one visited set so downgrade and fallback can never cycle.

use crate::error::{Result, RouterError};
use crate::types::{AgentBinding, ModelTarget, Pool, Rejection, ResolvedModel, TenantContext};
use meridian_core::{PoolId, PricingTable};
use meridian_providers::{AdapterRegistry, ProviderType};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

const NATIVE_RUNTIME_REASON: &str = "native_runtime required but provider is not claude-code";

/// Alias table: logical model names to concrete targets.
#[derive(Default, Clone)]
pub struct ModelCatalog {
    aliases: HashMap<String, ModelTarget>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: &str, target: ModelTarget) {
        self.aliases.insert(alias.to_string(), target);
    }

    pub fn get(&self, alias: &str) -> Option<&ModelTarget> {
        self.aliases.get(alias)
    }
}

/// What resolution produced, with the audit trail the operator needs.
#[derive(Debug, Clone)]
pub struct ResolvedSelection {
    pub model: ResolvedModel,
    pub downgraded: bool,
    pub fell_back: bool,
    pub rejections: Vec<Rejection>,
}

pub struct Resolver {
    catalog: ModelCatalog,
    registry: AdapterRegistry,
    pricing: PricingTable,
    fallback_chains: HashMap<String, Vec<String>>,
    downgrade_chains: HashMap<String, Vec<String>>,
}

impl Resolver {
    pub fn new(catalog: ModelCatalog, registry: AdapterRegistry, pricing: PricingTable) -> Self {
        Self {
            catalog,
            registry,
            pricing,
            fallback_chains: HashMap::new(),
            downgrade_chains: HashMap::new(),
        }
    }

    pub fn with_fallback_chains(mut self, chains: HashMap<String, Vec<String>>) -> Self {
        self.fallback_chains = chains;
        self
    }

    pub fn with_downgrade_chains(mut self, chains: HashMap<String, Vec<String>>) -> Self {
        self.downgrade_chains = chains;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Resolve a binding to an executable model.
    ///
    /// `budget_downgrade` is set when the scope's budget is exhausted
    /// and policy says downgrade rather than reject.
    pub fn resolve(
        &self,
        binding: &AgentBinding,
        budget_downgrade: bool,
    ) -> Result<ResolvedSelection> {
        let primary = self.catalog.get(&binding.model_alias).ok_or_else(|| {
            RouterError::BindingInvalid {
                agent: binding.agent.clone(),
                detail: format!("unknown model alias {}", binding.model_alias),
            }
        })?;

        // The primary must satisfy the binding outright; a broken
        // binding is a configuration error, not a fallback trigger.
        if let Some(capability) = primary.capabilities.first_missing(&binding.requires) {
            return Err(RouterError::CapabilityMismatch {
                candidate: primary.key(),
                capability: capability.to_string(),
            });
        }
        self.enforce_native_runtime(binding, primary)?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut rejections: Vec<Rejection> = Vec::new();
        visited.insert(primary.key());

        let mut selected = primary.clone();
        let mut downgraded = false;

        if budget_downgrade {
            let chain = self
                .downgrade_chains
                .get(&binding.model_alias)
                .cloned()
                .unwrap_or_default();
            match self.walk_chain(binding, &chain, &mut visited, &mut rejections, false) {
                Some(target) => {
                    debug!(agent = %binding.agent, from = %selected.key(), to = %target.key(), "Budget downgrade applied");
                    selected = target;
                    downgraded = true;
                }
                None => {
                    // Nothing cheaper exists; the request cannot be
                    // afforded at all.
                    return Err(RouterError::BudgetExceeded(binding.agent.clone()));
                }
            }
        }

        // Health gate on the selection, with fallback.
        let mut fell_back = false;
        if !self.is_healthy(&selected.provider) {
            warn!(agent = %binding.agent, model = %selected.key(), "Primary selection unhealthy, walking fallback chain");
            let chain = self
                .fallback_chains
                .get(&binding.model_alias)
                .cloned()
                .unwrap_or_default();
            match self.walk_chain(binding, &chain, &mut visited, &mut rejections, true) {
                Some(target) => {
                    selected = target;
                    fell_back = true;
                }
                None => {
                    return Err(RouterError::ProviderUnavailable {
                        agent: binding.agent.clone(),
                        rejections,
                    });
                }
            }
        }

        let pricing = self
            .pricing
            .get(&selected.provider, &selected.model)
            .map_err(|_| RouterError::ConfigInvalid(format!(
                "no pricing entry for {}",
                selected.key()
            )))?;
        let provider_type = self
            .registry
            .get_any(&selected.provider)
            .map(|a| a.provider_type())
            .ok_or_else(|| RouterError::ConfigInvalid(format!(
                "provider {} not registered",
                selected.provider
            )))?;

        Ok(ResolvedSelection {
            model: ResolvedModel {
                provider: selected.provider.clone(),
                model_id: selected.model.clone(),
                provider_type,
                pricing,
            },
            downgraded,
            fell_back,
            rejections,
        })
    }

    /// Walk an ordered alias chain, returning the first acceptable
    /// target. Every rejection is recorded with its reason.
    fn walk_chain(
        &self,
        binding: &AgentBinding,
        chain: &[String],
        visited: &mut HashSet<String>,
        rejections: &mut Vec<Rejection>,
        require_health: bool,
    ) -> Option<ModelTarget> {
        for alias in chain {
            let Some(target) = self.catalog.get(alias) else {
                rejections.push(Rejection {
                    candidate: alias.clone(),
                    reason: "unknown alias".to_string(),
                });
                continue;
            };
            let key = target.key();

            if !visited.insert(key.clone()) {
                rejections.push(Rejection {
                    candidate: key,
                    reason: "already considered (cycle)".to_string(),
                });
                continue;
            }
            if self.registry.is_disabled(&target.provider) {
                rejections.push(Rejection {
                    candidate: key,
                    reason: "provider disabled".to_string(),
                });
                continue;
            }
            if let Some(capability) = target.capabilities.first_missing(&binding.requires) {
                rejections.push(Rejection {
                    candidate: key,
                    reason: format!("missing capability {}", capability),
                });
                continue;
            }
            if binding.requires.native_runtime && !self.provider_is_native(&target.provider) {
                rejections.push(Rejection {
                    candidate: key,
                    reason: NATIVE_RUNTIME_REASON.to_string(),
                });
                continue;
            }
            if self.registry.get_any(&target.provider).is_none() {
                rejections.push(Rejection {
                    candidate: key,
                    reason: "provider not registered".to_string(),
                });
                continue;
            }
            if require_health && !self.is_healthy(&target.provider) {
                rejections.push(Rejection {
                    candidate: key,
                    reason: "provider unhealthy".to_string(),
                });
                continue;
            }
            return Some(target.clone());
        }
        None
    }

    fn enforce_native_runtime(&self, binding: &AgentBinding, target: &ModelTarget) -> Result<()> {
        if !binding.requires.native_runtime {
            return Ok(());
        }
        if self.provider_is_native(&target.provider) {
            Ok(())
        } else {
            let provider_type = self
                .registry
                .get_any(&target.provider)
                .map(|a| a.provider_type().to_string())
                .unwrap_or_else(|| "unregistered".to_string());
            Err(RouterError::NativeRuntimeRequired {
                candidate: target.key(),
                provider_type,
            })
        }
    }

    fn provider_is_native(&self, provider: &str) -> bool {
        self.registry
            .get_any(provider)
            .map(|a| a.provider_type() == ProviderType::ClaudeCode)
            .unwrap_or(false)
    }

    fn is_healthy(&self, provider: &str) -> bool {
        !self.registry.is_disabled(provider)
            && self
                .registry
                .get_any(provider)
                .map(|a| a.is_healthy())
                .unwrap_or(false)
    }
}

/// The single choke-point for tenant-aware pool selection.
///
/// Order: explicit request, task-type preference, tier default, global
/// default. Unauthorized pools are rejected before any dispatch.
pub fn select_pool(
    tenant: &TenantContext,
    requested: Option<&PoolId>,
    task_type: Option<&str>,
    pools: &HashMap<PoolId, Pool>,
    global_default: &PoolId,
) -> Result<Pool> {
    let lookup = |id: &PoolId| -> Result<Pool> {
        pools
            .get(id)
            .cloned()
            .ok_or_else(|| RouterError::ConfigInvalid(format!("unknown pool {}", id)))
    };

    if let Some(requested) = requested {
        if !tenant.is_authorized(requested) {
            return Err(RouterError::PoolUnauthorized {
                pool: requested.to_string(),
                tenant: tenant.tenant_id.to_string(),
            });
        }
        return lookup(requested);
    }

    if let Some(task_type) = task_type {
        if let Some(preferred) = tenant.task_preferences.get(task_type) {
            if tenant.is_authorized(preferred) {
                return lookup(preferred);
            }
            return Err(RouterError::PoolUnauthorized {
                pool: preferred.to_string(),
                tenant: tenant.tenant_id.to_string(),
            });
        }
    }

    // Tier default: deterministic order over the authorized set.
    let mut tier_pools: Vec<&Pool> = pools
        .values()
        .filter(|p| p.tier_access.iter().any(|t| t == &tenant.tier))
        .filter(|p| tenant.is_authorized(&p.id))
        .collect();
    tier_pools.sort_by(|a, b| a.id.cmp(&b.id));
    if let Some(pool) = tier_pools.first() {
        return Ok((*pool).clone());
    }

    if tenant.is_authorized(global_default) {
        return lookup(global_default);
    }

    Err(RouterError::AccessDenied(format!(
        "tenant {} has no authorized pool",
        tenant.tenant_id
    )))
}
