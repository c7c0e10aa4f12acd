//! Startup sequence
//!
//! Boots every subsystem in dependency order and reports structured
//! status per step. Fatal steps stop the gateway; warnings are logged
//! and served around.

use crate::auth::AuthService;
use crate::metrics::Metrics;
use crate::state::AppState;
use meridian_billing::settlement::HttpSettlementClient;
use meridian_billing::{
    BillingMachine, BudgetEnforcer, CircuitBreaker, LedgerWriteMonitor, ReplayWorker, SettlementApi,
};
use meridian_core::config::{Environment, GatewayConfig};
use meridian_dlq::types::PersistenceStatus;
use meridian_dlq::{DlqConfig, DlqStore};
use meridian_ensemble::{EnsembleConfig, MergeStrategy};
use meridian_ledger::Ledger;
use meridian_router::resolver::Resolver;
use meridian_router::{Router, RouterConfig};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use surrealdb::engine::any::connect;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Fatal,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Default, Serialize)]
pub struct StartupReport {
    pub checks: Vec<StartupCheck>,
}

impl StartupReport {
    fn push(&mut self, name: &'static str, status: CheckStatus, detail: impl Into<String>) {
        let detail = detail.into();
        match status {
            CheckStatus::Ok => info!(step = name, detail = %detail, "Startup check ok"),
            CheckStatus::Warning => warn!(step = name, detail = %detail, "Startup check warning"),
            CheckStatus::Fatal => error!(step = name, detail = %detail, "Startup check FATAL"),
        }
        self.checks.push(StartupCheck {
            name,
            status,
            detail,
        });
    }

    pub fn is_fatal(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Fatal)
    }
}

/// The parts of the fleet main.rs assembles from configuration:
/// resolver (catalog + registry + pricing), bindings, and pools.
pub struct FleetSpec {
    pub resolver: Resolver,
    pub bindings: Vec<meridian_router::types::AgentBinding>,
    pub pools: Vec<meridian_router::types::Pool>,
    pub router_config: RouterConfig,
}

/// Boot everything. Returns the shared state and the per-step report;
/// the caller decides whether a fatal report aborts the process.
pub async fn bootstrap(
    config: GatewayConfig,
    fleet: FleetSpec,
) -> anyhow::Result<(Option<AppState>, StartupReport)> {
    let mut report = StartupReport::default();

    // 1. Configuration.
    match config.validate() {
        Ok(()) => report.push("config", CheckStatus::Ok, "validated"),
        Err(e) => {
            report.push("config", CheckStatus::Fatal, e.to_string());
            return Ok((None, report));
        }
    }

    // 2. Filesystem writability.
    match tempfile::tempfile().and_then(|mut f| f.write_all(b"probe")) {
        Ok(()) => report.push("filesystem", CheckStatus::Ok, "temp dir writable"),
        Err(e) => report.push("filesystem", CheckStatus::Warning, e.to_string()),
    }

    // 3. Durable store.
    let db = match connect(&config.store_url).await {
        Ok(db) => {
            if let Err(e) = db.use_ns("meridian").use_db("gateway").await {
                report.push("store", CheckStatus::Fatal, e.to_string());
                return Ok((None, report));
            }
            report.push("store", CheckStatus::Ok, config.store_url.clone());
            db
        }
        Err(e) => {
            report.push("store", CheckStatus::Fatal, e.to_string());
            return Ok((None, report));
        }
    };

    // 4. Ledger (verifies every WAL checksum on replay).
    let ledger = match Ledger::open(db.clone()).await {
        Ok(ledger) => {
            report.push(
                "ledger",
                CheckStatus::Ok,
                format!("{} entries replayed", ledger.entry_count()),
            );
            Arc::new(ledger)
        }
        Err(e) => {
            report.push("ledger", CheckStatus::Fatal, e.to_string());
            return Ok((None, report));
        }
    };

    let machine = Arc::new(BillingMachine::new(db.clone(), Arc::clone(&ledger)));
    let budget = Arc::new(BudgetEnforcer::new(db.clone()));
    let monitor = Arc::new(LedgerWriteMonitor::new());
    let breaker = Arc::new(CircuitBreaker::new());

    // 5. DLQ durability probe (never throws).
    let dlq = Arc::new(DlqStore::new(
        db.clone(),
        config.store_url.clone(),
        DlqConfig::default(),
    ));
    match dlq.persistence_check().await {
        PersistenceStatus::Verified => {
            report.push("dlq", CheckStatus::Ok, "append-only durability verified")
        }
        PersistenceStatus::NotEnabled => report.push(
            "dlq",
            CheckStatus::Warning,
            "store is volatile; parked settlements will not survive restart",
        ),
        PersistenceStatus::CheckRestricted => report.push(
            "dlq",
            CheckStatus::Warning,
            "store refused durability introspection",
        ),
    }

    // 6. Settlement protocol handshake.
    let settlement_client = match HttpSettlementClient::new(
        config.settlement_base_url.clone(),
        config.settlement_issuer.clone(),
        config.settlement_audience.clone(),
        config.settlement_signing_key_pem.as_deref(),
        config.environment,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            report.push("settlement", CheckStatus::Fatal, e.to_string());
            return Ok((None, report));
        }
    };
    match settlement_client.handshake().await {
        Ok(()) => report.push("settlement", CheckStatus::Ok, "protocol compatible"),
        Err(e) => {
            let status = if config.environment == Environment::Production {
                CheckStatus::Fatal
            } else {
                CheckStatus::Warning
            };
            report.push("settlement", status, e.to_string());
            if status == CheckStatus::Fatal {
                return Ok((None, report));
            }
        }
    }

    // 7. Orphan reconciliation: stale reservations are released.
    match machine
        .reconcile_expired_reserves(chrono::Duration::minutes(10))
        .await
    {
        Ok(released) => report.push(
            "orphans",
            CheckStatus::Ok,
            format!("{} expired reservations released", released.len()),
        ),
        Err(e) => report.push("orphans", CheckStatus::Warning, e.to_string()),
    }

    // 8. Stale claim locks expire by TTL; nothing to repair eagerly.
    report.push("locks", CheckStatus::Ok, "claim locks recover by TTL");

    let worker = Arc::new(ReplayWorker::new(
        Arc::clone(&machine),
        Arc::clone(&dlq),
        settlement_client as Arc<dyn SettlementApi>,
        Arc::clone(&breaker),
    ));

    let mut router = Router::new(
        db.clone(),
        fleet.resolver,
        Arc::clone(&machine),
        Arc::clone(&budget),
        Arc::clone(&monitor),
        fleet.router_config,
    );
    for binding in fleet.bindings {
        router.register_binding(binding);
    }
    for pool in fleet.pools {
        router.register_pool(pool);
    }

    let auth = Arc::new(AuthService::new(
        db,
        config.settlement_issuer.as_bytes(),
        "meridian-treasury",
        8453,
    ));

    let state = AppState {
        config: Arc::new(config),
        router: Arc::new(router),
        machine,
        budget,
        dlq,
        worker,
        breaker,
        auth,
        metrics: Arc::new(Metrics::new()),
        ensemble_defaults: EnsembleConfig::new(MergeStrategy::FirstComplete),
    };

    Ok((Some(state), report))
}
