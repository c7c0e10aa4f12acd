//! HTTP surface
//!
//! Chat/invoke, wallet auth, API-key management, health, metrics,
//! discovery, and the token-parameterized homepage. Unauthenticated
//! chat earns a 402 carrying a payment challenge.

use crate::auth::PaymentChallenge;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use meridian_billing::settlement::SettlementRequest;
use meridian_core::{AccountId, MicroUsd, PoolId};
use meridian_ensemble::{BranchSpec, EnsembleConfig, EnsembleRunner, MergeStrategy};
use meridian_providers::{Message, ProviderRequest};
use meridian_router::error::RouterError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{error, info, warn};

pub fn build_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", get(homepage))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/.well-known/discovery", get(discovery))
        .route("/v1/chat", post(chat))
        .route("/auth/nonce", post(auth_nonce))
        .route("/auth/verify", post(auth_verify))
        .route("/keys", post(create_key))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// -- request/response shapes --

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EnsembleSpec {
    pools: Vec<String>,
    strategy: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequestBody {
    agent: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    ensemble: Option<EnsembleSpec>,
}

#[derive(Debug, Serialize)]
struct ChatResponseBody {
    content: String,
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    cost_micro: MicroUsd,
    billing_entry_id: Option<String>,
    ensemble_id: Option<String>,
}

// -- handlers --

async fn homepage(Query(params): Query<HashMap<String, String>>) -> Response {
    let greeting = match params.get("token") {
        Some(token) => format!("meridian gateway (session token {} accepted)\n", token),
        None => "meridian gateway\n".to_string(),
    };
    (StatusCode::OK, greeting).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let circuits = state.breaker.status();
    Json(json!({
        "status": "ok",
        "circuits": circuits,
    }))
    .into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    (StatusCode::OK, state.metrics.render()).into_response()
}

async fn discovery() -> Response {
    let body = "\
meridian model gateway
endpoints: POST /v1/chat, POST /auth/nonce, POST /auth/verify, POST /keys
auth: bearer api key, or 402 payment challenge-response
amounts: integer micro-USD as decimal strings
";
    (StatusCode::OK, body).into_response()
}

async fn auth_nonce(State(state): State<AppState>) -> Response {
    Json(json!({ "nonce": state.auth.issue_nonce() })).into_response()
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    nonce: String,
    address: String,
}

async fn auth_verify(State(state): State<AppState>, Json(body): Json<VerifyBody>) -> Response {
    match state.auth.verify_nonce(&body.nonce, &body.address) {
        Ok(session) => Json(json!({ "session": session })).into_response(),
        Err(e) => (StatusCode::UNAUTHORIZED, Json(json!({ "error": e.to_string() })))
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateKeyBody {
    label: String,
}

async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Response {
    let Some(session) = headers.get("x-session").and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "session required" })),
        )
            .into_response();
    };
    let Some(address) = state.auth.session_address(session) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unknown session" })),
        )
            .into_response();
    };
    match state.auth.create_api_key(&address, &body.label).await {
        Ok(key) => Json(json!({ "api_key": key })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Response {
    state.metrics.incr("chat_requests_total");

    // Authentication: bearer key, or a satisfied payment challenge.
    let account = match authenticate(&state, &headers).await {
        Ok(account) => account,
        Err(challenge) => {
            state.metrics.incr("chat_payment_challenges_total");
            return (StatusCode::PAYMENT_REQUIRED, Json(challenge)).into_response();
        }
    };

    let messages: Vec<Message> = body
        .messages
        .iter()
        .map(|m| match m.role.as_str() {
            "system" => Message::system(m.content.clone()),
            "assistant" => Message::assistant(m.content.clone()),
            _ => Message::user(m.content.clone()),
        })
        .collect();
    let mut request = ProviderRequest::new("unresolved", messages);
    if let Some(max_tokens) = body.max_tokens {
        request.options.max_tokens = Some(max_tokens);
    }

    if let Some(spec) = &body.ensemble {
        return ensemble_chat(&state, &account, request, spec).await;
    }

    match state
        .router
        .dispatch(&body.agent, &account, None, body.task_type.as_deref(), request)
        .await
    {
        Ok(outcome) => {
            state.metrics.incr("chat_dispatch_ok_total");
            // Settlement rides outside the caller's critical path.
            let worker = state.worker.clone();
            let settlement = outcome.settlement.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.settle_entry(&settlement).await {
                    error!(error = %e, "Initial settlement errored");
                }
            });

            Json(ChatResponseBody {
                content: outcome.response.content,
                model: outcome.selection_model,
                input_tokens: outcome.response.usage.input_tokens,
                output_tokens: outcome.response.usage.output_tokens,
                cost_micro: outcome.settlement.actual_cost_micro,
                billing_entry_id: Some(outcome.entry.billing_entry_id.to_string()),
                ensemble_id: None,
            })
            .into_response()
        }
        Err(e) => {
            state.metrics.incr("chat_dispatch_error_total");
            router_error_response(e)
        }
    }
}

/// Fan the request across the named pools and account each branch
/// under a shared ensemble id.
async fn ensemble_chat(
    state: &AppState,
    account: &AccountId,
    request: ProviderRequest,
    spec: &EnsembleSpec,
) -> Response {
    let strategy = match spec.strategy.as_str() {
        "first_complete" => MergeStrategy::FirstComplete,
        "best_of_n" => MergeStrategy::BestOfN,
        "consensus" => MergeStrategy::Consensus,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown strategy {}", other) })),
            )
                .into_response();
        }
    };

    let mut branches = Vec::new();
    for raw in &spec.pools {
        let Ok(pool_id) = raw.parse::<PoolId>() else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid pool id {}", raw) })),
            )
                .into_response();
        };
        let Some(pool) = state.router.pool(&pool_id) else {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("unknown pool {}", raw) })),
            )
                .into_response();
        };
        let adapter = match state.router.resolver().registry().get(&pool.provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": e.to_string(), "code": "PROVIDER_UNAVAILABLE" })),
                )
                    .into_response();
            }
        };
        let pricing = match state
            .router
            .resolver()
            .pricing()
            .get(&pool.provider, &pool.model)
        {
            Ok(pricing) => pricing,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string(), "code": "CONFIG_INVALID" })),
                )
                    .into_response();
            }
        };
        branches.push(BranchSpec {
            pool_id,
            provider: pool.provider.clone(),
            model: pool.model.clone(),
            pricing,
            adapter,
        });
    }

    let config = EnsembleConfig {
        strategy,
        ..EnsembleConfig::new(strategy)
    };
    let runner = EnsembleRunner::new(config);

    match runner.run(branches, request, None).await {
        Ok(result) => {
            state.metrics.incr("ensemble_ok_total");
            // Each branch settles individually under the ensemble id.
            for report in &result.all_results {
                if report.cost_micro == MicroUsd::ZERO {
                    continue;
                }
                let machine = state.machine.clone();
                let worker = state.worker.clone();
                let account = account.clone();
                let cost = report.cost_micro;
                let ensemble_id = result.ensemble_id.clone();
                tokio::spawn(async move {
                    let reserved = machine
                        .reserve(
                            &account,
                            cost,
                            meridian_core::CorrelationId::random(),
                            Decimal::ONE,
                        )
                        .await;
                    let entry = match reserved {
                        Ok(entry) => entry,
                        Err(e) => {
                            error!(error = %e, "Ensemble branch reserve failed");
                            return;
                        }
                    };
                    if let Err(e) = machine.commit(&entry.billing_entry_id, cost, None).await {
                        error!(error = %e, "Ensemble branch commit failed");
                        return;
                    }
                    let settlement = SettlementRequest {
                        reservation_id: entry.billing_entry_id,
                        actual_cost_micro: cost,
                        account_id: Some(account),
                        identity_anchor: None,
                        ensemble_id: Some(ensemble_id),
                    };
                    if let Err(e) = worker.settle_entry(&settlement).await {
                        error!(error = %e, "Ensemble branch settlement errored");
                    }
                });
            }

            Json(ChatResponseBody {
                content: result.content,
                model: result.model,
                input_tokens: result.usage.input_tokens,
                output_tokens: result.usage.output_tokens,
                cost_micro: result.total_cost_micro,
                billing_entry_id: None,
                ensemble_id: Some(result.ensemble_id),
            })
            .into_response()
        }
        Err(e) => {
            state.metrics.incr("ensemble_error_total");
            let status = match &e {
                meridian_ensemble::EnsembleError::BudgetExceeded { .. } => {
                    StatusCode::PAYMENT_REQUIRED
                }
                meridian_ensemble::EnsembleError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                meridian_ensemble::EnsembleError::Cancelled => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(json!({ "error": e.to_string(), "code": e.code() })),
            )
                .into_response()
        }
    }
}

/// Bearer key, satisfied challenge, or a fresh 402 challenge.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AccountId, PaymentChallenge> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(key) = value.strip_prefix("Bearer ") {
            if let Ok(account) = state.auth.verify_api_key(key).await {
                if let Ok(account) = AccountId::new(account) {
                    return Ok(account);
                }
            }
        }
    }

    if let Some(value) = headers.get("x-payment-proof").and_then(|v| v.to_str().ok()) {
        if let Ok(challenge) = serde_json::from_str::<PaymentChallenge>(value) {
            if state.auth.verify_challenge(&challenge).is_ok() {
                let account = AccountId::new(format!("payg:{}", challenge.nonce))
                    .expect("nonce is non-empty");
                // The paid amount becomes spendable balance for this
                // one call.
                match state.machine.mint(&account, challenge.amount).await {
                    Ok(()) => return Ok(account),
                    Err(e) => error!(error = %e, "Pay-per-call mint failed"),
                }
            }
        }
    }

    Err(state.auth.issue_challenge(MicroUsd::new(10_000)))
}

fn router_error_response(e: RouterError) -> Response {
    let status = match &e {
        RouterError::BindingNotFound(_) => StatusCode::NOT_FOUND,
        RouterError::AccessDenied(_) | RouterError::PoolUnauthorized { .. } => {
            StatusCode::FORBIDDEN
        }
        RouterError::BudgetExceeded(_) => StatusCode::PAYMENT_REQUIRED,
        RouterError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        RouterError::BudgetCircuitOpen | RouterError::ProviderUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RouterError::ContextOverflow { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        RouterError::BindingInvalid { .. }
        | RouterError::CapabilityMismatch { .. }
        | RouterError::NativeRuntimeRequired { .. }
        | RouterError::ConfigInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let retryable = e.is_retryable();
    let body = json!({
        "error": e.to_string(),
        "code": e.code(),
        "retryable": retryable,
    });
    if status.is_server_error() {
        warn!(code = e.code(), "Dispatch failed");
    } else {
        info!(code = e.code(), "Dispatch refused");
    }
    (status, Json(body)).into_response()
}
