use async_trait::async_trait;
use meridian_billing::{BillingMachine, BillingState, BudgetEnforcer, BudgetLimit, LedgerWriteMonitor};
use meridian_core::config::BudgetPolicy;
use meridian_core::{AccountId, MicroUsd, PricingEntry, PricingTable};
use meridian_ledger::Ledger;
use meridian_providers::{
    AdapterRegistry, Message, MockAdapter, ProviderRequest, ToolCall,
};
use meridian_router::error::RouterError;
use meridian_router::rate_limit::RateLimiter;
use meridian_router::resolver::{ModelCatalog, Resolver};
use meridian_router::tool_loop::ToolExecutor;
use meridian_router::types::{AgentBinding, CapabilitySet, ModelTarget};
use meridian_router::{Router, RouterConfig};
use serde_json::json;
use std::sync::Arc;
use surrealdb::engine::any::connect;

struct World {
    router: Router,
    machine: Arc<BillingMachine>,
    budget: Arc<BudgetEnforcer>,
    monitor: Arc<LedgerWriteMonitor>,
    adapter: Arc<MockAdapter>,
    account: AccountId,
}

async fn setup(config: RouterConfig) -> World {
    let db = connect("mem://").await.unwrap();
    db.use_ns("meridian").use_db("router").await.unwrap();

    let ledger = Arc::new(Ledger::open(db.clone()).await.unwrap());
    let machine = Arc::new(BillingMachine::new(db.clone(), ledger));
    let budget = Arc::new(BudgetEnforcer::new(db.clone()));
    let monitor = Arc::new(LedgerWriteMonitor::new());

    let adapter = Arc::new(MockAdapter::new("anthropic"));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter.clone());

    let mut catalog = ModelCatalog::new();
    catalog.insert(
        "opus",
        ModelTarget {
            provider: "anthropic".to_string(),
            model: "claude-opus".to_string(),
            capabilities: CapabilitySet {
                tool_calling: true,
                streaming: true,
                ..CapabilitySet::default()
            },
        },
    );

    let mut pricing = PricingTable::new();
    // 1 µUSD per token either way keeps the arithmetic legible.
    pricing.insert("anthropic", "claude-opus", PricingEntry::new(1_000_000, 1_000_000));

    let resolver = Resolver::new(catalog, registry, pricing);
    let mut router = Router::new(
        db,
        resolver,
        Arc::clone(&machine),
        Arc::clone(&budget),
        Arc::clone(&monitor),
        config,
    );
    router.register_binding(AgentBinding::new("support-bot", "opus"));

    let account = AccountId::new("u1").unwrap();
    machine.mint(&account, MicroUsd::new(1_000_000)).await.unwrap();

    World {
        router,
        machine,
        budget,
        monitor,
        adapter,
        account,
    }
}

fn request() -> ProviderRequest {
    ProviderRequest::new("placeholder", vec![Message::user("hello")]).max_tokens(100)
}

#[tokio::test]
async fn test_dispatch_reserves_commits_and_prices_usage() {
    let world = setup(RouterConfig::default()).await;
    world
        .adapter
        .push_response(MockAdapter::text_response("hi there", "claude-opus", 40, 60));

    let outcome = world
        .router
        .dispatch("support-bot", &world.account, None, None, request())
        .await
        .expect("dispatch failed");

    assert_eq!(outcome.response.content, "hi there");
    assert_eq!(outcome.selection_model, "anthropic:claude-opus");
    // 40 + 60 tokens at 1 µUSD per token.
    assert_eq!(outcome.settlement.actual_cost_micro, MicroUsd::new(100));

    let entry = world
        .machine
        .get(&outcome.entry.billing_entry_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, BillingState::FinalizePending);
    assert_eq!(entry.actual_cost, Some(MicroUsd::new(100)));

    // Budget counter saw exactly the actual.
    let snapshot = world.budget.budget_snapshot("tenant:u1");
    assert_eq!(snapshot.spent, MicroUsd::new(100));
}

#[tokio::test]
async fn test_provider_failure_releases_reservation() {
    let world = setup(RouterConfig::default()).await;
    world.adapter.push_outcome(meridian_providers::MockOutcome::Fail {
        status: 500,
        message: "upstream exploded".to_string(),
    });

    let result = world
        .router
        .dispatch("support-bot", &world.account, None, None, request())
        .await;
    assert!(matches!(result, Err(RouterError::Provider(_))));

    // No held funds remain.
    let ledger = world.machine.ledger();
    let held = ledger.derive_balance(&meridian_core::AccountKey::held(&world.account));
    assert_eq!(held, MicroUsd::ZERO);
}

#[tokio::test]
async fn test_unknown_agent_is_binding_not_found() {
    let world = setup(RouterConfig::default()).await;
    let result = world
        .router
        .dispatch("nobody", &world.account, None, None, request())
        .await;
    match result {
        Err(RouterError::BindingNotFound(agent)) => assert_eq!(agent, "nobody"),
        other => panic!("expected BindingNotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_budget_exceeded_rejects_before_dispatch() {
    let world = setup(RouterConfig::default()).await;
    world
        .budget
        .set_limit("tenant:u1", BudgetLimit::new(MicroUsd::new(50)));
    world
        .budget
        .record_cost("tenant:u1", MicroUsd::new(50))
        .await
        .unwrap();

    let result = world
        .router
        .dispatch("support-bot", &world.account, None, None, request())
        .await;
    assert!(matches!(result, Err(RouterError::BudgetExceeded(_))));
    // The adapter never saw the request.
    assert_eq!(world.adapter.call_count(), 0);
}

#[tokio::test]
async fn test_budget_circuit_open_refuses_dispatch() {
    let config = RouterConfig {
        max_unknown_window: std::time::Duration::from_millis(10),
        ..RouterConfig::default()
    };
    let world = setup(config).await;

    world.monitor.record_write_failure();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let result = world
        .router
        .dispatch("support-bot", &world.account, None, None, request())
        .await;
    assert!(matches!(result, Err(RouterError::BudgetCircuitOpen)));
    assert_eq!(world.adapter.call_count(), 0);
}

#[tokio::test]
async fn test_rate_limit_surfaces_as_retryable() {
    let mut world = setup(RouterConfig::default()).await;
    let router = world.router;
    world.router = router.with_rate_limiter(RateLimiter::new(0, 0.0));

    let result = world
        .router
        .dispatch("support-bot", &world.account, None, None, request())
        .await;
    match result {
        Err(e @ RouterError::RateLimited(_)) => assert!(e.is_retryable()),
        other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
    }
}

// -- tool loop --

struct EchoTool {
    failures_before_success: parking_lot::Mutex<u32>,
    executions: parking_lot::Mutex<u32>,
}

impl EchoTool {
    fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success: parking_lot::Mutex::new(failures_before_success),
            executions: parking_lot::Mutex::new(0),
        }
    }

    fn executions(&self) -> u32 {
        *self.executions.lock()
    }
}

#[async_trait]
impl ToolExecutor for EchoTool {
    async fn execute(
        &self,
        _name: &str,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        *self.executions.lock() += 1;
        let mut remaining = self.failures_before_success.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err("tool backend unavailable".to_string());
        }
        Ok(json!({"echo": arguments}))
    }
}

fn tool_call_response(id: &str, arguments: &str) -> meridian_providers::ProviderResponse {
    let mut response = MockAdapter::text_response("", "claude-opus", 10, 10);
    response.tool_calls = vec![ToolCall {
        id: id.to_string(),
        name: "echo".to_string(),
        arguments: arguments.to_string(),
    }];
    response.finish_reason = "tool_use".to_string();
    response
}

#[tokio::test]
async fn test_tool_loop_executes_and_accumulates_usage() {
    let world = setup(RouterConfig::default()).await;
    world
        .adapter
        .push_response(tool_call_response("tc_1", r#"{"q":"x"}"#));
    world
        .adapter
        .push_response(MockAdapter::text_response("done", "claude-opus", 20, 30));

    let executor = Arc::new(EchoTool::new(0));
    let outcome = world
        .router
        .dispatch_with_tools("support-bot", &world.account, request(), executor.clone())
        .await
        .expect("tool dispatch failed");

    assert_eq!(outcome.response.content, "done");
    assert_eq!(executor.executions(), 1);
    // Usage across both model turns: (10+10) + (20+30) = 70 µUSD.
    assert_eq!(outcome.settlement.actual_cost_micro, MicroUsd::new(70));
}

#[tokio::test]
async fn test_tool_results_memoized_by_call_id() {
    let world = setup(RouterConfig::default()).await;
    // The model repeats the identical tool_call_id twice.
    world
        .adapter
        .push_response(tool_call_response("tc_same", r#"{"q":"x"}"#));
    world
        .adapter
        .push_response(tool_call_response("tc_same", r#"{"q":"x"}"#));
    world
        .adapter
        .push_response(MockAdapter::text_response("done", "claude-opus", 5, 5));

    let executor = Arc::new(EchoTool::new(0));
    world
        .router
        .dispatch_with_tools("support-bot", &world.account, request(), executor.clone())
        .await
        .expect("tool dispatch failed");

    // Second occurrence was served from the memo, not re-executed.
    assert_eq!(executor.executions(), 1);
}

#[tokio::test]
async fn test_malformed_arguments_get_one_repair_round() {
    let world = setup(RouterConfig::default()).await;
    world
        .adapter
        .push_response(tool_call_response("tc_bad", "{not json"));
    world
        .adapter
        .push_response(MockAdapter::text_response("recovered", "claude-opus", 5, 5));

    let executor = Arc::new(EchoTool::new(0));
    let outcome = world
        .router
        .dispatch_with_tools("support-bot", &world.account, request(), executor.clone())
        .await
        .expect("tool dispatch failed");

    assert_eq!(outcome.response.content, "recovered");
    // The malformed call never reached the executor.
    assert_eq!(executor.executions(), 0);
}

#[tokio::test]
async fn test_consecutive_tool_failures_abort() {
    let config = RouterConfig {
        tool_loop: meridian_router::tool_loop::ToolLoopConfig {
            consecutive_failure_limit: 2,
            ..Default::default()
        },
        ..RouterConfig::default()
    };
    let world = setup(config).await;
    world
        .adapter
        .push_response(tool_call_response("tc_1", r#"{"q":"x"}"#));
    world
        .adapter
        .push_response(tool_call_response("tc_2", r#"{"q":"y"}"#));

    let executor = Arc::new(EchoTool::new(10));
    let result = world
        .router
        .dispatch_with_tools("support-bot", &world.account, request(), executor)
        .await;
    assert!(matches!(
        result,
        Err(RouterError::ToolCallConsecutiveFailures(2))
    ));

    // Reservation released on abort.
    let ledger = world.machine.ledger();
    let held = ledger.derive_balance(&meridian_core::AccountKey::held(&world.account));
    assert_eq!(held, MicroUsd::ZERO);
}

#[tokio::test]
async fn test_max_iterations_bounds_the_loop() {
    let config = RouterConfig {
        tool_loop: meridian_router::tool_loop::ToolLoopConfig {
            max_iterations: 2,
            ..Default::default()
        },
        ..RouterConfig::default()
    };
    let world = setup(config).await;
    // The model keeps asking for tools forever.
    world
        .adapter
        .push_response(tool_call_response("tc_1", r#"{"q":"a"}"#));
    world
        .adapter
        .push_response(tool_call_response("tc_2", r#"{"q":"b"}"#));
    world
        .adapter
        .push_response(tool_call_response("tc_3", r#"{"q":"c"}"#));

    let executor = Arc::new(EchoTool::new(0));
    let result = world
        .router
        .dispatch_with_tools("support-bot", &world.account, request(), executor)
        .await;
    assert!(matches!(result, Err(RouterError::ToolCallMaxIterations(2))));
}
