//! Meridian Router - Agent to model dispatch
//!
//! Resolves agents to concrete models, gates every dispatch on budget
//! and ledger health, wraps execution in the reservation lifecycle, and
//! runs the bounded tool-call loop.

pub mod error;
pub mod rate_limit;
pub mod resolver;
pub mod tool_loop;
pub mod types;

use crate::error::{Result, RouterError};
use crate::rate_limit::RateLimiter;
use crate::resolver::{select_pool, ResolvedSelection, Resolver};
use crate::tool_loop::{run_tool_loop, IterationGate, ToolExecutor, ToolLoopConfig, ToolLoopOutcome};
use crate::types::{AgentBinding, Pool, RoutingLog, TenantContext};
use async_trait::async_trait;
use chrono::Utc;
use meridian_billing::settlement::SettlementRequest;
use meridian_billing::{BillingEntry, BillingMachine, BudgetEnforcer, LedgerWriteMonitor};
use meridian_core::config::BudgetPolicy;
use meridian_core::{AccountId, PoolId, Usage};
use meridian_providers::{ProviderRequest, ProviderResponse};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub budget_policy: BudgetPolicy,
    /// How long the ledger write path may be failing before new
    /// dispatches are refused.
    pub max_unknown_window: Duration,
    pub global_default_pool: PoolId,
    pub retain_routing_logs: bool,
    pub tool_loop: ToolLoopConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            budget_policy: BudgetPolicy::Reject,
            max_unknown_window: Duration::from_secs(30),
            global_default_pool: PoolId::new("default").expect("static pool id"),
            retain_routing_logs: true,
            tool_loop: ToolLoopConfig::default(),
        }
    }
}

/// Everything one dispatch produced: the model's answer, the billing
/// entry now pending finalize, and the settlement record to send.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: ProviderResponse,
    pub entry: BillingEntry,
    pub settlement: SettlementRequest,
    pub selection_model: String,
    pub downgraded: bool,
    pub fell_back: bool,
}

pub struct Router {
    db: Surreal<Any>,
    resolver: Resolver,
    bindings: HashMap<String, AgentBinding>,
    pools: HashMap<PoolId, Pool>,
    machine: Arc<BillingMachine>,
    budget: Arc<BudgetEnforcer>,
    monitor: Arc<LedgerWriteMonitor>,
    rate_limiter: RateLimiter,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        db: Surreal<Any>,
        resolver: Resolver,
        machine: Arc<BillingMachine>,
        budget: Arc<BudgetEnforcer>,
        monitor: Arc<LedgerWriteMonitor>,
        config: RouterConfig,
    ) -> Self {
        Self {
            db,
            resolver,
            bindings: HashMap::new(),
            pools: HashMap::new(),
            machine,
            budget,
            monitor,
            rate_limiter: RateLimiter::new(60, 10.0),
            config,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn register_binding(&mut self, binding: AgentBinding) {
        self.bindings.insert(binding.agent.clone(), binding);
    }

    pub fn register_pool(&mut self, pool: Pool) {
        self.pools.insert(pool.id.clone(), pool);
    }

    pub fn pool(&self, id: &PoolId) -> Option<&Pool> {
        self.pools.get(id)
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// The tenant choke-point: claims in, authorized pool out.
    pub fn select_tenant_pool(
        &self,
        tenant: &TenantContext,
        requested: Option<&PoolId>,
        task_type: Option<&str>,
    ) -> Result<Pool> {
        select_pool(
            tenant,
            requested,
            task_type,
            &self.pools,
            &self.config.global_default_pool,
        )
    }

    /// Resolve and dispatch a single (non-ensemble) request.
    pub async fn dispatch(
        &self,
        agent: &str,
        account: &AccountId,
        tenant: Option<&TenantContext>,
        task_type: Option<&str>,
        mut request: ProviderRequest,
    ) -> Result<DispatchOutcome> {
        let binding = self
            .bindings
            .get(agent)
            .ok_or_else(|| RouterError::BindingNotFound(agent.to_string()))?;

        // Tenant pool authorization happens before anything is spent.
        if let Some(tenant) = tenant {
            let pool = self.select_tenant_pool(tenant, None, task_type)?;
            info!(agent = %agent, tenant = %tenant.tenant_id, pool = %pool.id, "Pool selected");
        }

        let scope = budget_scope(account);
        let selection = self.gate_and_resolve(binding, &scope).await?;
        let model = &selection.model;

        if !self.rate_limiter.try_acquire(&model.provider) {
            return Err(RouterError::RateLimited(model.provider.clone()));
        }

        let adapter = self.resolver.registry().get(&model.provider)?;
        request.model = model.model_id.clone();
        if let Some(temperature) = binding.temperature {
            request.options.temperature = temperature;
        }

        // Reserve the estimate before dispatch.
        let estimate = estimate_cost(&request, model)?;
        let entry = match self
            .machine
            .reserve(account, estimate, request.correlation_id.clone(), Decimal::ONE)
            .await
        {
            Ok(entry) => {
                self.monitor.record_write_ok();
                entry
            }
            Err(e) => {
                if ledger_write_failed(&e) {
                    self.monitor.record_write_failure();
                }
                return Err(e.into());
            }
        };

        match adapter.complete(request.clone()).await {
            Ok(response) => {
                let actual = model.pricing.cost(&response.usage)?;
                let entry = match self
                    .machine
                    .commit(&entry.billing_entry_id, actual, None)
                    .await
                {
                    Ok(entry) => {
                        self.monitor.record_write_ok();
                        entry
                    }
                    Err(e) => {
                        if ledger_write_failed(&e) {
                            self.monitor.record_write_failure();
                        }
                        return Err(e.into());
                    }
                };
                self.budget.record_cost(&scope, actual).await.map_err(
                    meridian_billing::BillingError::from,
                )?;

                self.log_routing(RoutingLog {
                    id: None,
                    timestamp: Utc::now(),
                    agent: agent.to_string(),
                    tenant: tenant.map(|t| t.tenant_id.to_string()),
                    pool: None,
                    selected_model: model.key(),
                    downgraded: selection.downgraded,
                    fell_back: selection.fell_back,
                    rejections: selection.rejections.clone(),
                    cost_micro: Some(actual.get()),
                    is_critical: false,
                })
                .await;

                let settlement = SettlementRequest {
                    reservation_id: entry.billing_entry_id.clone(),
                    actual_cost_micro: actual,
                    account_id: Some(account.clone()),
                    identity_anchor: None,
                    ensemble_id: None,
                };

                Ok(DispatchOutcome {
                    response,
                    entry,
                    settlement,
                    selection_model: model.key(),
                    downgraded: selection.downgraded,
                    fell_back: selection.fell_back,
                })
            }
            Err(provider_error) => {
                // Nothing streamed, nothing owed.
                if let Err(release_error) = self
                    .machine
                    .release(&entry.billing_entry_id, "pre_stream_failure")
                    .await
                {
                    error!(
                        entry = %entry.billing_entry_id,
                        error = %release_error,
                        "Failed to release reservation after provider error"
                    );
                }

                self.log_routing(RoutingLog {
                    id: None,
                    timestamp: Utc::now(),
                    agent: agent.to_string(),
                    tenant: tenant.map(|t| t.tenant_id.to_string()),
                    pool: None,
                    selected_model: model.key(),
                    downgraded: selection.downgraded,
                    fell_back: selection.fell_back,
                    rejections: selection.rejections.clone(),
                    cost_micro: None,
                    is_critical: true,
                })
                .await;

                Err(provider_error.into())
            }
        }
    }

    /// Dispatch with a tool loop between reserve and commit. Budget,
    /// circuit, and rate limit are re-checked before every model turn.
    pub async fn dispatch_with_tools(
        &self,
        agent: &str,
        account: &AccountId,
        request: ProviderRequest,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<DispatchOutcome> {
        let binding = self
            .bindings
            .get(agent)
            .ok_or_else(|| RouterError::BindingNotFound(agent.to_string()))?;

        let scope = budget_scope(account);
        let selection = self.gate_and_resolve(binding, &scope).await?;
        let model = selection.model.clone();

        let adapter = self.resolver.registry().get(&model.provider)?;
        let mut request = request;
        request.model = model.model_id.clone();

        let estimate = estimate_cost(&request, &model)?;
        let entry = self
            .machine
            .reserve(account, estimate, request.correlation_id.clone(), Decimal::ONE)
            .await?;

        let gate = DispatchGate {
            router: self,
            scope: scope.clone(),
            provider: model.provider.clone(),
        };

        let outcome: ToolLoopOutcome = match run_tool_loop(
            adapter,
            request,
            executor,
            &gate,
            &self.config.tool_loop,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(release_error) = self
                    .machine
                    .release(&entry.billing_entry_id, "tool_loop_failure")
                    .await
                {
                    error!(
                        entry = %entry.billing_entry_id,
                        error = %release_error,
                        "Failed to release reservation after tool loop error"
                    );
                }
                return Err(e);
            }
        };

        let actual = model.pricing.cost(&outcome.total_usage)?;
        let entry = self
            .machine
            .commit(&entry.billing_entry_id, actual, None)
            .await?;
        self.budget
            .record_cost(&scope, actual)
            .await
            .map_err(meridian_billing::BillingError::from)?;

        let settlement = SettlementRequest {
            reservation_id: entry.billing_entry_id.clone(),
            actual_cost_micro: actual,
            account_id: Some(account.clone()),
            identity_anchor: None,
            ensemble_id: None,
        };

        Ok(DispatchOutcome {
            response: outcome.response,
            entry,
            settlement,
            selection_model: model.key(),
            downgraded: selection.downgraded,
            fell_back: selection.fell_back,
        })
    }

    /// Shared pre-dispatch gating: ledger-health circuit, then budget
    /// (with downgrade policy), then resolution.
    async fn gate_and_resolve(
        &self,
        binding: &AgentBinding,
        scope: &str,
    ) -> Result<ResolvedSelection> {
        if self
            .monitor
            .is_budget_circuit_open(self.config.max_unknown_window)
        {
            return Err(RouterError::BudgetCircuitOpen);
        }

        let exceeded = self.budget.is_exceeded(scope).await;
        if exceeded && self.config.budget_policy == BudgetPolicy::Reject {
            return Err(RouterError::BudgetExceeded(scope.to_string()));
        }
        let downgrade = exceeded && self.config.budget_policy == BudgetPolicy::Downgrade;
        if downgrade {
            warn!(agent = %binding.agent, scope = %scope, "Budget exhausted, attempting downgrade");
        }

        self.resolver.resolve(binding, downgrade)
    }

    async fn log_routing(&self, log: RoutingLog) {
        if !self.config.retain_routing_logs {
            return;
        }
        let _: Option<RoutingLog> = self
            .db
            .create("routing_logs")
            .content(log)
            .await
            .ok()
            .flatten();
    }
}

/// Per-iteration gate used inside the tool loop.
struct DispatchGate<'a> {
    router: &'a Router,
    scope: String,
    provider: String,
}

#[async_trait]
impl IterationGate for DispatchGate<'_> {
    async fn check(&self) -> Result<()> {
        if self
            .router
            .monitor
            .is_budget_circuit_open(self.router.config.max_unknown_window)
        {
            return Err(RouterError::BudgetCircuitOpen);
        }
        if self.router.budget.is_exceeded(&self.scope).await {
            return Err(RouterError::BudgetExceeded(self.scope.clone()));
        }
        if !self.router.rate_limiter.try_acquire(&self.provider) {
            return Err(RouterError::RateLimited(self.provider.clone()));
        }
        Ok(())
    }
}

fn budget_scope(account: &AccountId) -> String {
    format!("tenant:{}", account)
}

/// Pre-dispatch estimate: rough input tokens plus the full output cap.
fn estimate_cost(
    request: &ProviderRequest,
    model: &crate::types::ResolvedModel,
) -> Result<meridian_core::MicroUsd> {
    let input_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    let usage = Usage::new(
        (input_chars / 4) as u64,
        request.options.max_tokens.unwrap_or(4096) as u64,
    );
    Ok(model.pricing.cost(&usage)?)
}

fn ledger_write_failed(error: &meridian_billing::BillingError) -> bool {
    matches!(
        error,
        meridian_billing::BillingError::Ledger(_) | meridian_billing::BillingError::Database(_)
    )
}

pub use resolver::{ModelCatalog, ResolvedSelection as Selection};
pub use types::{CapabilitySet, ModelTarget, Rejection, ResolvedModel};
