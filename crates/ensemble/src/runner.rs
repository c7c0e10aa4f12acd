//! Parallel ensemble execution
//!
//! Fans one request out to N branches under a parent cancellation
//! token. Strategy decides the merge; every terminating path cancels
//! whatever is still in flight. A child token can never cancel its
//! parent.

use crate::types::{
    BranchReport, BranchSpec, EnsembleConfig, EnsembleError, EnsembleResult, MergeStrategy, Result,
};
use async_trait::async_trait;
use meridian_core::{MicroUsd, Usage};
use meridian_providers::{ProviderRequest, ProviderResponse};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scores a successful branch for best_of_n.
#[async_trait]
pub trait BranchScorer: Send + Sync {
    async fn score(&self, response: &ProviderResponse) -> f64;
}

/// Default: information per token.
pub struct DensityScorer;

#[async_trait]
impl BranchScorer for DensityScorer {
    async fn score(&self, response: &ProviderResponse) -> f64 {
        let tokens = response.usage.output_tokens.max(1) as f64;
        response.content.len() as f64 / tokens
    }
}

pub struct EnsembleRunner {
    config: EnsembleConfig,
    scorer: Arc<dyn BranchScorer>,
}

impl EnsembleRunner {
    pub fn new(config: EnsembleConfig) -> Self {
        Self {
            config,
            scorer: Arc::new(DensityScorer),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn BranchScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Run the ensemble to completion.
    pub async fn run(
        &self,
        branches: Vec<BranchSpec>,
        request: ProviderRequest,
        external: Option<CancellationToken>,
    ) -> Result<EnsembleResult> {
        if branches.is_empty() {
            return Err(EnsembleError::Config("no branches".to_string()));
        }

        let parent = CancellationToken::new();
        if let Some(external) = external {
            link_external(&parent, external);
        }

        let ensemble_id = uuid::Uuid::new_v4().to_string();
        info!(
            ensemble = %ensemble_id,
            branches = branches.len(),
            strategy = ?self.config.strategy,
            "Ensemble dispatch"
        );

        let result = tokio::select! {
            result = self.execute(&ensemble_id, branches, request, &parent) => result,
            _ = tokio::time::sleep(self.config.total_timeout) => {
                warn!(ensemble = %ensemble_id, "Ensemble total timeout");
                Err(EnsembleError::Timeout(self.config.total_timeout))
            }
        };

        // Every terminating path kills whatever is still running.
        parent.cancel();
        result
    }

    async fn execute(
        &self,
        ensemble_id: &str,
        branches: Vec<BranchSpec>,
        request: ProviderRequest,
        parent: &CancellationToken,
    ) -> Result<EnsembleResult> {
        let mut set: JoinSet<(usize, BranchReport)> = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let child = parent.child_token();
            set.spawn(run_branch(
                index,
                branch.clone(),
                request.clone(),
                child,
                self.config.per_model_budget,
                self.config.per_branch_timeout,
            ));
        }

        match self.config.strategy {
            MergeStrategy::FirstComplete => {
                self.merge_first_complete(ensemble_id, &branches, set, parent)
                    .await
            }
            MergeStrategy::BestOfN => {
                let reports = collect_all(&branches, set).await;
                self.merge_best_of_n(ensemble_id, reports).await
            }
            MergeStrategy::Consensus => {
                let reports = collect_all(&branches, set).await;
                self.merge_consensus(ensemble_id, reports)
            }
        }
    }

    /// Race: first usable result wins, everyone else is cancelled.
    async fn merge_first_complete(
        &self,
        ensemble_id: &str,
        branches: &[BranchSpec],
        mut set: JoinSet<(usize, BranchReport)>,
        parent: &CancellationToken,
    ) -> Result<EnsembleResult> {
        let mut reports: Vec<Option<BranchReport>> = vec![None; branches.len()];
        let mut winner: Option<usize> = None;

        while let Some(joined) = set.join_next().await {
            let Ok((index, report)) = joined else {
                continue;
            };
            let usable = report.result.is_some();
            reports[index] = Some(report);
            if usable && winner.is_none() {
                winner = Some(index);
                debug!(ensemble = %ensemble_id, winner = %branches[index].key(), "Race winner, cancelling losers");
                parent.cancel();
            }
        }

        let all_results = finalize_reports(branches, reports);

        let Some(winner) = winner else {
            if all_results.iter().all(|r| r.cancelled) {
                return Err(EnsembleError::Cancelled);
            }
            return Err(all_failed(&all_results));
        };

        // Only the winner's cost is attributed; losers were cancelled
        // before completion. Completed-but-failed branches still carry
        // recorded cost, which counts against the total.
        let total_cost = sum_costs(&all_results);
        self.check_total_budget(total_cost)?;

        let winning = all_results[winner]
            .result
            .clone()
            .expect("winner has a result");

        Ok(EnsembleResult {
            ensemble_id: ensemble_id.to_string(),
            content: winning.content.clone(),
            model: winning.model.clone(),
            usage: winning.usage.clone(),
            total_cost_micro: all_results[winner].cost_micro,
            all_results,
        })
    }

    /// Let everyone finish, score the successes, keep the best.
    pub(crate) async fn merge_best_of_n(
        &self,
        ensemble_id: &str,
        all_results: Vec<BranchReport>,
    ) -> Result<EnsembleResult> {
        let total_cost = sum_costs(&all_results);
        // Budget first: a blown budget fails the run regardless of what
        // the scorer would have said.
        self.check_total_budget(total_cost)?;

        let mut best: Option<(usize, f64)> = None;
        for (index, report) in all_results.iter().enumerate() {
            let Some(response) = &report.result else {
                continue;
            };
            let score = self.scorer.score(response).await;
            debug!(ensemble = %ensemble_id, model = %report.model, score = score, "Branch scored");
            let better = match best {
                None => true,
                Some((_, best_score)) => score > best_score,
            };
            if better {
                best = Some((index, score));
            }
        }

        let Some((index, _)) = best else {
            return Err(all_failed(&all_results));
        };
        let winning = all_results[index].result.clone().expect("scored branch");

        Ok(EnsembleResult {
            ensemble_id: ensemble_id.to_string(),
            content: winning.content.clone(),
            model: winning.model.clone(),
            usage: winning.usage.clone(),
            total_cost_micro: total_cost,
            all_results,
        })
    }

    /// Per-field majority vote over extracted JSON objects.
    pub(crate) fn merge_consensus(
        &self,
        ensemble_id: &str,
        all_results: Vec<BranchReport>,
    ) -> Result<EnsembleResult> {
        let total_cost = sum_costs(&all_results);
        self.check_total_budget(total_cost)?;

        let successes: Vec<&BranchReport> = all_results
            .iter()
            .filter(|r| r.result.is_some())
            .collect();
        if successes.is_empty() {
            return Err(all_failed(&all_results));
        }

        let mut usage = Usage::default();
        for report in &successes {
            usage.add(&report.result.as_ref().expect("success").usage);
        }
        let members = successes
            .iter()
            .map(|r| r.result.as_ref().expect("success").model.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let model = format!("consensus({})", members);

        let parsed: Vec<serde_json::Map<String, Value>> = successes
            .iter()
            .filter_map(|r| {
                let content = &r.result.as_ref().expect("success").content;
                serde_json::from_str::<Value>(content)
                    .ok()
                    .and_then(|v| v.as_object().cloned())
            })
            .collect();

        let content = if parsed.is_empty() {
            // Nothing structured came back; first success verbatim.
            successes[0].result.as_ref().expect("success").content.clone()
        } else {
            Value::Object(majority_vote(&parsed)).to_string()
        };

        Ok(EnsembleResult {
            ensemble_id: ensemble_id.to_string(),
            content,
            model,
            usage,
            total_cost_micro: total_cost,
            all_results,
        })
    }

    fn check_total_budget(&self, total: MicroUsd) -> Result<()> {
        if total > self.config.total_budget {
            return Err(EnsembleError::BudgetExceeded {
                spent: total.get(),
                budget: self.config.total_budget.get(),
            });
        }
        Ok(())
    }
}

/// Field-by-field majority vote. Ties break toward the value first
/// voted for; field order follows first appearance.
fn majority_vote(objects: &[serde_json::Map<String, Value>]) -> serde_json::Map<String, Value> {
    let mut field_order: Vec<String> = Vec::new();
    let mut votes: HashMap<String, Vec<(Value, usize)>> = HashMap::new();

    for object in objects {
        for (field, value) in object {
            if !votes.contains_key(field) {
                field_order.push(field.clone());
            }
            let tallies = votes.entry(field.clone()).or_default();
            match tallies.iter_mut().find(|(v, _)| v == value) {
                Some(tally) => tally.1 += 1,
                None => tallies.push((value.clone(), 1)),
            }
        }
    }

    let mut consensus = serde_json::Map::new();
    for field in field_order {
        let tallies = &votes[&field];
        // Strictly-greater comparison keeps the earliest vote on ties.
        let mut best = &tallies[0];
        for tally in &tallies[1..] {
            if tally.1 > best.1 {
                best = tally;
            }
        }
        consensus.insert(field, best.0.clone());
    }
    consensus
}

/// One branch: clamp the output cap to the per-model budget, call the
/// adapter under its child token, recompute actual cost from usage.
async fn run_branch(
    index: usize,
    branch: BranchSpec,
    mut request: ProviderRequest,
    child: CancellationToken,
    per_model_budget: MicroUsd,
    per_branch_timeout: std::time::Duration,
) -> (usize, BranchReport) {
    request.model = branch.model.clone();
    if let Some(budget_cap) = branch.pricing.max_output_tokens(per_model_budget) {
        let caller_cap = request.options.max_tokens.unwrap_or(u32::MAX);
        let clamped = budget_cap.min(u32::MAX as u64) as u32;
        request.options.max_tokens = Some(caller_cap.min(clamped));
    }

    let report_base = |result, error, cost, cancelled| BranchReport {
        pool_id: branch.pool_id.clone(),
        model: branch.key(),
        result,
        error,
        cost_micro: cost,
        cancelled,
    };

    let work = async {
        match tokio::time::timeout(per_branch_timeout, branch.adapter.complete(request)).await {
            Ok(Ok(response)) => {
                let cost = branch.pricing.cost(&response.usage).unwrap_or(MicroUsd::ZERO);
                if cost > per_model_budget {
                    // Result discarded, cost still recorded.
                    report_base(
                        None,
                        Some(format!(
                            "per-model budget exceeded: {} > {}",
                            cost, per_model_budget
                        )),
                        cost,
                        false,
                    )
                } else {
                    report_base(Some(response), None, cost, false)
                }
            }
            Ok(Err(e)) => report_base(None, Some(e.to_string()), MicroUsd::ZERO, false),
            Err(_) => report_base(
                None,
                Some(format!("branch timeout after {:?}", per_branch_timeout)),
                MicroUsd::ZERO,
                false,
            ),
        }
    };

    let report = tokio::select! {
        _ = child.cancelled() => report_base(None, Some("cancelled".to_string()), MicroUsd::ZERO, true),
        report = work => report,
    };
    (index, report)
}

async fn collect_all(
    branches: &[BranchSpec],
    mut set: JoinSet<(usize, BranchReport)>,
) -> Vec<BranchReport> {
    let mut reports: Vec<Option<BranchReport>> = vec![None; branches.len()];
    while let Some(joined) = set.join_next().await {
        if let Ok((index, report)) = joined {
            reports[index] = Some(report);
        }
    }
    finalize_reports(branches, reports)
}

fn finalize_reports(
    branches: &[BranchSpec],
    reports: Vec<Option<BranchReport>>,
) -> Vec<BranchReport> {
    reports
        .into_iter()
        .enumerate()
        .map(|(index, report)| {
            report.unwrap_or_else(|| BranchReport {
                pool_id: branches[index].pool_id.clone(),
                model: branches[index].key(),
                result: None,
                error: Some("branch task aborted".to_string()),
                cost_micro: MicroUsd::ZERO,
                cancelled: true,
            })
        })
        .collect()
}

fn sum_costs(reports: &[BranchReport]) -> MicroUsd {
    MicroUsd::new(reports.iter().map(|r| r.cost_micro.get()).sum())
}

pub(crate) fn all_failed(reports: &[BranchReport]) -> EnsembleError {
    let summary = reports
        .iter()
        .map(|r| {
            format!(
                "{}: {}",
                r.model,
                r.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    EnsembleError::AllBranchesFailed { summary }
}

/// Compose an external token into the parent without ever letting a
/// child cancel upward: a one-shot forwarding listener.
pub(crate) fn link_external(parent: &CancellationToken, external: CancellationToken) {
    let forward = parent.clone();
    let guard = parent.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = external.cancelled() => forward.cancel(),
            // Parent finished on its own; listener retires.
            _ = guard.cancelled() => {}
        }
    });
}
