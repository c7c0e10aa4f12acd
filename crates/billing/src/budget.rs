//! Fail-closed budget enforcer
//!
//! One durable micro-USD counter per scope, mirrored into memory. The
//! durable side is authoritative: enforcement reads go to the store and
//! any ambiguity answers "exceeded". The mirror exists for advisory
//! reads that must never fail.

use crate::error::BudgetError;
use dashmap::DashMap;
use meridian_core::MicroUsd;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{error, warn};

const TABLE_COUNTERS: &str = "budget_counters";

/// Durable counter row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CounterRow {
    scope: String,
    spent: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub limit: MicroUsd,
    /// Fraction of the limit at which advisory warnings begin.
    pub warn_ratio: f64,
}

impl BudgetLimit {
    pub fn new(limit: MicroUsd) -> Self {
        Self {
            limit,
            warn_ratio: 0.8,
        }
    }
}

/// Advisory view of one scope, served from the mirror.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub scope: String,
    pub spent: MicroUsd,
    pub limit: Option<MicroUsd>,
    pub warning: bool,
}

/// One scope's durable-vs-mirror disagreement.
#[derive(Debug, Clone, Serialize)]
pub struct DriftAlert {
    pub scope: String,
    pub durable: i64,
    pub mirror: i64,
    pub drift_ratio: f64,
}

pub struct BudgetEnforcer {
    db: Surreal<Any>,
    limits: DashMap<String, BudgetLimit>,
    mirror: DashMap<String, i64>,
}

impl BudgetEnforcer {
    pub fn new(db: Surreal<Any>) -> Self {
        Self {
            db,
            limits: DashMap::new(),
            mirror: DashMap::new(),
        }
    }

    pub fn set_limit(&self, scope: &str, limit: BudgetLimit) {
        self.limits.insert(scope.to_string(), limit);
    }

    /// Record spend: durable atomic increment, then the mirror.
    ///
    /// A store failure rejects the whole request; money is never
    /// tracked on the mirror alone.
    pub async fn record_cost(&self, scope: &str, delta: MicroUsd) -> Result<(), BudgetError> {
        if delta.get() < 0 {
            return Err(BudgetError::NegativeDelta(delta.get()));
        }

        let result = self
            .db
            .query(
                "UPSERT type::thing($tb, $scope)
                 SET scope = $scope, spent += $delta
                 RETURN AFTER",
            )
            .bind(("tb", TABLE_COUNTERS))
            .bind(("scope", scope.to_string()))
            .bind(("delta", delta.get()))
            .await;

        match result {
            Ok(_) => {
                *self.mirror.entry(scope.to_string()).or_insert(0) += delta.get();
                Ok(())
            }
            Err(e) => {
                error!(scope = %scope, error = %e, "Budget store unreachable, rejecting request");
                Err(BudgetError::Unavailable {
                    scope: scope.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Enforcement read against the durable store. Fail-closed: any
    /// error answers true.
    pub async fn is_exceeded(&self, scope: &str) -> bool {
        let Some(limit) = self.limits.get(scope).map(|l| *l) else {
            return false;
        };
        match self.durable_spent(scope).await {
            Ok(spent) => spent >= limit.limit.get(),
            Err(e) => {
                warn!(scope = %scope, error = %e, "Budget read failed, failing closed");
                true
            }
        }
    }

    /// Advisory warning check from the mirror. Never fails.
    pub fn is_warning(&self, scope: &str) -> bool {
        let Some(limit) = self.limits.get(scope).map(|l| *l) else {
            return false;
        };
        let spent = self.mirror.get(scope).map(|v| *v).unwrap_or(0);
        (spent as f64) >= (limit.limit.get() as f64) * limit.warn_ratio
    }

    /// Advisory snapshot from the mirror. Never fails.
    pub fn budget_snapshot(&self, scope: &str) -> BudgetSnapshot {
        let spent = self.mirror.get(scope).map(|v| *v).unwrap_or(0);
        BudgetSnapshot {
            scope: scope.to_string(),
            spent: MicroUsd::new(spent),
            limit: self.limits.get(scope).map(|l| l.limit),
            warning: self.is_warning(scope),
        }
    }

    /// Compare durable and mirror values for every mirrored scope.
    /// Drift beyond 1% of the durable value is flagged; the durable
    /// value stays authoritative either way.
    pub async fn reconcile_drift(&self) -> Vec<DriftAlert> {
        let mut alerts = Vec::new();
        let scopes: Vec<String> = self.mirror.iter().map(|e| e.key().clone()).collect();
        for scope in scopes {
            let Ok(durable) = self.durable_spent(&scope).await else {
                continue;
            };
            let mirror = self.mirror.get(&scope).map(|v| *v).unwrap_or(0);
            let base = durable.abs().max(1) as f64;
            let drift_ratio = (durable - mirror).abs() as f64 / base;
            if drift_ratio > 0.01 {
                warn!(
                    scope = %scope,
                    durable = durable,
                    mirror = mirror,
                    "Budget mirror drift exceeds 1%"
                );
                alerts.push(DriftAlert {
                    scope,
                    durable,
                    mirror,
                    drift_ratio,
                });
            }
        }
        alerts
    }

    async fn durable_spent(&self, scope: &str) -> Result<i64, surrealdb::Error> {
        let row: Option<CounterRow> = self.db.select((TABLE_COUNTERS, scope)).await?;
        Ok(row.map(|r| r.spent).unwrap_or(0))
    }
}
