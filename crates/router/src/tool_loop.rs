//! Bounded tool-call loop
//!
//! Alternates model turns and tool executions under hard ceilings:
//! iterations, total calls, wall time, context utilization, and
//! consecutive tool failures. Tool results are memoized by
//! `(trace_id, tool_call_id)` so a retried identical call id never
//! re-executes, including error-shaped results.

use crate::error::{Result, RouterError};
use async_trait::async_trait;
use meridian_core::Usage;
use meridian_providers::{
    Message, ProviderAdapter, ProviderRequest, ProviderResponse,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Executes one tool invocation. Errors are strings fed back to the
/// model, not crate errors; the loop decides when to abort.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, String>;
}

/// Re-checked before every model turn: budget, circuit, rate limit.
#[async_trait]
pub trait IterationGate: Send + Sync {
    async fn check(&self) -> Result<()>;
}

/// A gate that always passes, for tests and gate-free callers.
pub struct OpenGate;

#[async_trait]
impl IterationGate for OpenGate {
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    pub max_iterations: u32,
    pub max_total_tool_calls: u32,
    pub max_wall_time: Duration,
    /// Context window of the target model, in tokens.
    pub context_window_tokens: u32,
    pub consecutive_failure_limit: u32,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            max_total_tool_calls: 24,
            max_wall_time: Duration::from_secs(120),
            context_window_tokens: 200_000,
            consecutive_failure_limit: 3,
        }
    }
}

/// Final response plus usage accumulated across every model turn.
#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    pub response: ProviderResponse,
    pub total_usage: Usage,
    pub iterations: u32,
    pub tool_calls_executed: u32,
}

/// Rough token estimate: four characters per token.
fn estimate_tokens(messages: &[Message]) -> u32 {
    let chars: usize = messages
        .iter()
        .map(|m| {
            m.content.len()
                + m.tool_calls
                    .iter()
                    .map(|c| c.name.len() + c.arguments.len())
                    .sum::<usize>()
        })
        .sum();
    (chars / 4) as u32
}

pub async fn run_tool_loop(
    adapter: Arc<dyn ProviderAdapter>,
    base_request: ProviderRequest,
    executor: Arc<dyn ToolExecutor>,
    gate: &dyn IterationGate,
    config: &ToolLoopConfig,
) -> Result<ToolLoopOutcome> {
    let started = Instant::now();
    let mut messages = base_request.messages.clone();
    let mut total_usage = Usage::default();
    let mut total_calls: u32 = 0;
    let mut consecutive_failures: u32 = 0;
    // Memoized results, keyed by tool_call_id within this trace.
    let mut memo: HashMap<String, String> = HashMap::new();
    // Tools that already used their one malformed-JSON repair round.
    let mut repair_used: HashSet<String> = HashSet::new();

    for iteration in 1..=config.max_iterations {
        gate.check().await?;

        if started.elapsed() > config.max_wall_time {
            return Err(RouterError::ToolCallWallTimeExceeded(config.max_wall_time));
        }

        let used = estimate_tokens(&messages);
        let used_pct = used * 100 / config.context_window_tokens.max(1);
        if used_pct >= 90 {
            return Err(RouterError::ContextOverflow { used_pct });
        }
        if used_pct >= 80 {
            warn!(
                trace = %base_request.trace_id,
                used_pct = used_pct,
                "Context utilization past warning threshold"
            );
        }

        let mut request = base_request.clone();
        request.messages = messages.clone();
        let response = adapter.complete(request).await?;
        total_usage.add(&response.usage);

        if response.tool_calls.is_empty() {
            return Ok(ToolLoopOutcome {
                response,
                total_usage,
                iterations: iteration,
                tool_calls_executed: total_calls,
            });
        }

        // Record the assistant turn, then answer each call.
        let mut assistant = Message::assistant(response.content.clone());
        assistant.tool_calls = response.tool_calls.clone();
        messages.push(assistant);

        for call in &response.tool_calls {
            total_calls += 1;
            if total_calls > config.max_total_tool_calls {
                return Err(RouterError::ToolCallLimitExceeded(
                    config.max_total_tool_calls,
                ));
            }

            let content = if let Some(cached) = memo.get(&call.id) {
                debug!(trace = %base_request.trace_id, call = %call.id, "Tool result served from memo");
                cached.clone()
            } else {
                let content = match serde_json::from_str::<serde_json::Value>(&call.arguments) {
                    Ok(arguments) => match executor.execute(&call.name, &arguments).await {
                        Ok(value) => {
                            consecutive_failures = 0;
                            value.to_string()
                        }
                        Err(message) => {
                            consecutive_failures += 1;
                            if consecutive_failures >= config.consecutive_failure_limit {
                                return Err(RouterError::ToolCallConsecutiveFailures(
                                    consecutive_failures,
                                ));
                            }
                            json!({ "error": message }).to_string()
                        }
                    },
                    Err(parse_error) => {
                        // One repair round per tool: feed the parse
                        // error back as the result. A second malformed
                        // call for the same tool counts as a failure.
                        if repair_used.insert(call.name.clone()) {
                            json!({
                                "error": format!("invalid JSON arguments: {}", parse_error)
                            })
                            .to_string()
                        } else {
                            consecutive_failures += 1;
                            if consecutive_failures >= config.consecutive_failure_limit {
                                return Err(RouterError::ToolCallConsecutiveFailures(
                                    consecutive_failures,
                                ));
                            }
                            json!({
                                "error": format!("invalid JSON arguments: {}", parse_error)
                            })
                            .to_string()
                        }
                    }
                };
                memo.insert(call.id.clone(), content.clone());
                content
            };

            messages.push(Message::tool_result(call.id.clone(), content));
        }
    }

    Err(RouterError::ToolCallMaxIterations(config.max_iterations))
}
