use crate::auth::AuthService;
use crate::metrics::Metrics;
use meridian_billing::{BillingMachine, BudgetEnforcer, CircuitBreaker, ReplayWorker};
use meridian_core::config::GatewayConfig;
use meridian_dlq::DlqStore;
use meridian_ensemble::EnsembleConfig;
use meridian_router::Router;
use std::sync::Arc;

/// Everything the HTTP surface needs, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<Router>,
    pub machine: Arc<BillingMachine>,
    pub budget: Arc<BudgetEnforcer>,
    pub dlq: Arc<DlqStore>,
    pub worker: Arc<ReplayWorker>,
    pub breaker: Arc<CircuitBreaker>,
    pub auth: Arc<AuthService>,
    pub metrics: Arc<Metrics>,
    pub ensemble_defaults: EnsembleConfig,
}
