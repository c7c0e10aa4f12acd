//! Streaming ensemble execution
//!
//! first_complete races branches by manual advance: each branch stream
//! is pulled one chunk at a time, and the first content-bearing chunk
//! latches the winner. The winner's iterator is never consumed by the
//! race loop itself; it is handed off intact so the main consumer can
//! keep reading it. best_of_n and consensus buffer every branch fully
//! and then merge; they are not incremental.

use crate::cost::BranchCostTracker;
use crate::runner::EnsembleRunner;
use crate::types::{
    BranchReport, BranchSpec, EnsembleError, EnsembleResult, MergeStrategy, Result,
};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use meridian_core::{MicroUsd, PoolId, Usage};
use meridian_providers::{ChunkStream, ProviderRequest, ProviderResponse, StreamChunk, ToolCall};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cost view of one branch after a streaming run.
#[derive(Debug, Clone)]
pub struct BranchCost {
    pub pool_id: PoolId,
    pub model: String,
    pub cost_micro: MicroUsd,
    /// Precise when the provider reported usage; otherwise an
    /// overcount upper bound from observed chunks.
    pub precise: bool,
    pub cancelled: bool,
    pub error: Option<String>,
}

enum BranchState {
    /// Still racing when the winner latched; cancelled.
    Cancelled,
    Failed(String),
    Winner,
}

struct BranchLedger {
    spec: BranchSpec,
    tracker: Arc<BranchCostTracker>,
    state: BranchState,
}

/// Result of a streaming first_complete run: the forwarded stream plus
/// per-branch cost data, readable once the stream has ended.
pub struct StreamingFirstComplete {
    pub ensemble_id: String,
    pub winner_pool: PoolId,
    stream: Option<ChunkStream>,
    ledger: Vec<BranchLedger>,
}

impl StreamingFirstComplete {
    /// The output stream: the winning branch's chunks, first
    /// content-bearing chunk first, provider order preserved.
    pub fn take_stream(&mut self) -> ChunkStream {
        self.stream.take().expect("stream already taken")
    }

    /// Branch-level cost data. The winner's figure is precise once the
    /// stream has been consumed to the end; losers carry best-effort
    /// overcount estimates.
    pub fn branch_costs(&self) -> Vec<BranchCost> {
        self.ledger
            .iter()
            .map(|entry| {
                let precise_cost = entry.tracker.precise_cost(&entry.spec.pricing);
                let cost = precise_cost
                    .unwrap_or_else(|| entry.tracker.overcount_estimate(&entry.spec.pricing));
                BranchCost {
                    pool_id: entry.spec.pool_id.clone(),
                    model: entry.spec.key(),
                    cost_micro: cost,
                    precise: precise_cost.is_some(),
                    cancelled: matches!(entry.state, BranchState::Cancelled),
                    error: match &entry.state {
                        BranchState::Failed(reason) => Some(reason.clone()),
                        _ => None,
                    },
                }
            })
            .collect()
    }
}

/// What a streaming run produced.
pub enum StreamingOutcome {
    /// first_complete: incremental forwarding of the winner.
    Incremental(StreamingFirstComplete),
    /// best_of_n / consensus: fully buffered merge.
    Buffered(EnsembleResult),
}

impl EnsembleRunner {
    /// Streaming entry point, dispatching on the configured strategy.
    pub async fn run_streaming(
        &self,
        branches: Vec<BranchSpec>,
        request: ProviderRequest,
        external: Option<CancellationToken>,
    ) -> Result<StreamingOutcome> {
        if branches.is_empty() {
            return Err(EnsembleError::Config("no branches".to_string()));
        }
        match self.config().strategy {
            MergeStrategy::FirstComplete => self
                .stream_first_complete(branches, request, external)
                .await
                .map(StreamingOutcome::Incremental),
            MergeStrategy::BestOfN | MergeStrategy::Consensus => self
                .stream_buffered(branches, request, external)
                .await
                .map(StreamingOutcome::Buffered),
        }
    }

    async fn stream_first_complete(
        &self,
        branches: Vec<BranchSpec>,
        request: ProviderRequest,
        external: Option<CancellationToken>,
    ) -> Result<StreamingFirstComplete> {
        let ensemble_id = uuid::Uuid::new_v4().to_string();
        let parent = CancellationToken::new();
        if let Some(external) = external {
            crate::runner::link_external(&parent, external);
        }

        let trackers: Vec<Arc<BranchCostTracker>> = branches
            .iter()
            .map(|_| Arc::new(BranchCostTracker::new()))
            .collect();

        // Open every branch stream concurrently. Openings that fail are
        // failed branches, not fatal.
        let mut opened: Vec<Option<ChunkStream>> = Vec::with_capacity(branches.len());
        let mut states: Vec<Option<BranchState>> = Vec::with_capacity(branches.len());
        {
            let openings = branches.iter().map(|branch| {
                let mut request = request.clone();
                request.model = branch.model.clone();
                if let Some(cap) = branch
                    .pricing
                    .max_output_tokens(self.config().per_model_budget)
                {
                    let caller_cap = request.options.max_tokens.unwrap_or(u32::MAX);
                    request.options.max_tokens =
                        Some(caller_cap.min(cap.min(u32::MAX as u64) as u32));
                }
                branch.adapter.stream(request)
            });
            for result in futures::future::join_all(openings).await {
                match result {
                    Ok(stream) => {
                        opened.push(Some(stream));
                        states.push(None);
                    }
                    Err(e) => {
                        opened.push(None);
                        states.push(Some(BranchState::Failed(e.to_string())));
                    }
                }
            }
        }

        // Manual advance: one pending next() per live branch. The
        // future owns its stream and hands it back with the chunk, so
        // the winner's iterator survives the race intact.
        let mut advances = FuturesUnordered::new();
        for (index, stream) in opened.into_iter().enumerate() {
            if let Some(mut stream) = stream {
                advances.push(
                    async move {
                        let chunk = stream.next().await;
                        (index, chunk, stream)
                    }
                    .boxed(),
                );
            }
        }

        let deadline = tokio::time::sleep(self.config().total_timeout);
        tokio::pin!(deadline);

        let winner = loop {
            if advances.is_empty() {
                // Everyone failed or ended before content.
                let reports = self.states_to_reports(&branches, &states);
                return Err(crate::runner::all_failed(&reports));
            }
            tokio::select! {
                _ = parent.cancelled() => {
                    return Err(EnsembleError::Cancelled);
                }
                _ = &mut deadline => {
                    warn!(ensemble = %ensemble_id, "Streaming race timed out");
                    return Err(EnsembleError::Timeout(self.config().total_timeout));
                }
                advanced = advances.next() => {
                    let Some((index, chunk, stream)) = advanced else { continue };
                    match chunk {
                        Some(Ok(chunk)) => {
                            trackers[index].record_chunk(chunk_content_len(&chunk));
                            if chunk.is_content_bearing() {
                                break (index, chunk, stream);
                            }
                            // Metadata only: advance this branch again.
                            let mut stream = stream;
                            advances.push(
                                async move {
                                    let chunk = stream.next().await;
                                    (index, chunk, stream)
                                }
                                .boxed(),
                            );
                        }
                        Some(Err(e)) => {
                            debug!(ensemble = %ensemble_id, branch = %branches[index].key(), error = %e, "Branch stream errored in race");
                            states[index] = Some(BranchState::Failed(e.to_string()));
                        }
                        None => {
                            states[index] = Some(BranchState::Failed(
                                "stream ended without content".to_string(),
                            ));
                        }
                    }
                }
            }
        };

        let (winner_index, first_chunk, winner_stream) = winner;
        info!(
            ensemble = %ensemble_id,
            winner = %branches[winner_index].key(),
            "Streaming race decided, cancelling losers"
        );

        // Dropping the remaining advance futures drops the losers'
        // streams, which aborts their in-flight requests.
        drop(advances);
        parent.cancel();

        let ledger: Vec<BranchLedger> = branches
            .iter()
            .enumerate()
            .map(|(index, spec)| BranchLedger {
                spec: spec.clone(),
                tracker: Arc::clone(&trackers[index]),
                state: match states[index].take() {
                    Some(state) => state,
                    None if index == winner_index => BranchState::Winner,
                    None => BranchState::Cancelled,
                },
            })
            .collect();

        // Forward the winner verbatim, tapping usage for precise cost.
        let tap = Arc::clone(&trackers[winner_index]);
        let tapped = winner_stream.map(move |item| {
            if let Ok(chunk) = &item {
                tap.record_chunk(chunk_content_len(chunk));
                if let StreamChunk::UsageDelta { usage, .. } = chunk {
                    tap.record_usage(usage);
                }
            }
            item
        });
        let output: ChunkStream =
            Box::pin(futures::stream::iter(vec![Ok(first_chunk)]).chain(tapped));

        Ok(StreamingFirstComplete {
            ensemble_id,
            winner_pool: branches[winner_index].pool_id.clone(),
            stream: Some(output),
            ledger,
        })
    }

    fn states_to_reports(
        &self,
        branches: &[BranchSpec],
        states: &[Option<BranchState>],
    ) -> Vec<BranchReport> {
        branches
            .iter()
            .zip(states)
            .map(|(spec, state)| BranchReport {
                pool_id: spec.pool_id.clone(),
                model: spec.key(),
                result: None,
                error: Some(match state {
                    Some(BranchState::Failed(reason)) => reason.clone(),
                    _ => "no content produced".to_string(),
                }),
                cost_micro: MicroUsd::ZERO,
                cancelled: false,
            })
            .collect()
    }

    /// Buffered streaming: drain every branch fully, assemble synthetic
    /// responses, then merge exactly like the sync strategies.
    async fn stream_buffered(
        &self,
        branches: Vec<BranchSpec>,
        request: ProviderRequest,
        external: Option<CancellationToken>,
    ) -> Result<EnsembleResult> {
        let ensemble_id = uuid::Uuid::new_v4().to_string();
        let parent = CancellationToken::new();
        if let Some(external) = external {
            crate::runner::link_external(&parent, external);
        }

        let mut set: JoinSet<(usize, BranchReport)> = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let child = parent.child_token();
            let branch = branch.clone();
            let mut request = request.clone();
            request.model = branch.model.clone();
            let per_model_budget = self.config().per_model_budget;
            let per_branch_timeout = self.config().per_branch_timeout;
            set.spawn(async move {
                let drain = async {
                    match branch.adapter.stream(request).await {
                        Ok(stream) => {
                            match tokio::time::timeout(per_branch_timeout, drain_stream(stream, &branch))
                                .await
                            {
                                Ok(response) => response,
                                Err(_) => Err(format!(
                                    "branch timeout after {:?}",
                                    per_branch_timeout
                                )),
                            }
                        }
                        Err(e) => Err(e.to_string()),
                    }
                };

                let report = tokio::select! {
                    _ = child.cancelled() => BranchReport {
                        pool_id: branch.pool_id.clone(),
                        model: branch.key(),
                        result: None,
                        error: Some("cancelled".to_string()),
                        cost_micro: MicroUsd::ZERO,
                        cancelled: true,
                    },
                    drained = drain => match drained {
                        Ok(response) => {
                            let cost = branch
                                .pricing
                                .cost(&response.usage)
                                .unwrap_or(MicroUsd::ZERO);
                            if cost > per_model_budget {
                                BranchReport {
                                    pool_id: branch.pool_id.clone(),
                                    model: branch.key(),
                                    result: None,
                                    error: Some(format!(
                                        "per-model budget exceeded: {} > {}",
                                        cost, per_model_budget
                                    )),
                                    cost_micro: cost,
                                    cancelled: false,
                                }
                            } else {
                                BranchReport {
                                    pool_id: branch.pool_id.clone(),
                                    model: branch.key(),
                                    result: Some(response),
                                    error: None,
                                    cost_micro: cost,
                                    cancelled: false,
                                }
                            }
                        }
                        Err(reason) => BranchReport {
                            pool_id: branch.pool_id.clone(),
                            model: branch.key(),
                            result: None,
                            error: Some(reason),
                            cost_micro: MicroUsd::ZERO,
                            cancelled: false,
                        },
                    },
                };
                (index, report)
            });
        }

        let reports = {
            let mut reports: Vec<Option<BranchReport>> = vec![None; branches.len()];
            let collect = async {
                while let Some(joined) = set.join_next().await {
                    if let Ok((index, report)) = joined {
                        reports[index] = Some(report);
                    }
                }
            };
            tokio::select! {
                _ = collect => {}
                _ = tokio::time::sleep(self.config().total_timeout) => {
                    parent.cancel();
                    return Err(EnsembleError::Timeout(self.config().total_timeout));
                }
            }
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
                .collect::<Vec<_>>()
        };
        parent.cancel();

        match self.config().strategy {
            MergeStrategy::BestOfN => self.merge_best_of_n(&ensemble_id, reports).await,
            MergeStrategy::Consensus => self.merge_consensus(&ensemble_id, reports),
            MergeStrategy::FirstComplete => unreachable!("dispatched above"),
        }
    }
}

fn chunk_content_len(chunk: &StreamChunk) -> usize {
    match chunk {
        StreamChunk::Text { delta } => delta.len(),
        StreamChunk::ToolCallDelta {
            arguments_delta, ..
        } => arguments_delta.len(),
        _ => 0,
    }
}

/// Assemble a full response from a drained chunk sequence.
async fn drain_stream(
    mut stream: ChunkStream,
    branch: &BranchSpec,
) -> std::result::Result<ProviderResponse, String> {
    let mut content = String::new();
    let mut usage = Usage::default();
    let mut stop_reason = "end_turn".to_string();
    let mut model = branch.key();
    // Tool calls assemble in arrival order, arguments accumulated
    // across deltas.
    let mut tool_order: Vec<String> = Vec::new();
    let mut tool_parts: HashMap<String, (String, String)> = HashMap::new();
    let mut current_tool: Option<String> = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(StreamChunk::MessageStart { model: m }) => model = m,
            Ok(StreamChunk::Text { delta }) => content.push_str(&delta),
            Ok(StreamChunk::ToolCallDelta {
                id,
                name,
                arguments_delta,
            }) => {
                if let Some(id) = id {
                    tool_order.push(id.clone());
                    tool_parts
                        .insert(id.clone(), (name.unwrap_or_default(), String::new()));
                    current_tool = Some(id);
                }
                if let Some(current) = &current_tool {
                    if let Some((_, arguments)) = tool_parts.get_mut(current) {
                        arguments.push_str(&arguments_delta);
                    }
                }
            }
            Ok(StreamChunk::UsageDelta {
                usage: reported,
                stop_reason: reason,
            }) => {
                usage = reported;
                if let Some(reason) = reason {
                    stop_reason = reason;
                }
            }
            Ok(StreamChunk::StreamError { message }) => return Err(message),
            Ok(StreamChunk::ContentBlockStop) => current_tool = None,
            Ok(StreamChunk::MessageStop) => break,
            Err(e) => return Err(e.to_string()),
        }
    }

    let tool_calls: Vec<ToolCall> = tool_order
        .into_iter()
        .filter_map(|id| {
            tool_parts.remove(&id).map(|(name, arguments)| ToolCall {
                id,
                name,
                arguments: if arguments.is_empty() {
                    Value::Object(Default::default()).to_string()
                } else {
                    arguments
                },
            })
        })
        .collect();

    Ok(ProviderResponse {
        content,
        model,
        usage,
        finish_reason: stop_reason,
        tool_calls,
    })
}
