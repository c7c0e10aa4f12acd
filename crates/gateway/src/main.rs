use meridian_core::config::GatewayConfig;
use meridian_core::{PoolId, PricingEntry, PricingTable};
use meridian_gateway::{bootstrap, build_app, FleetSpec};
use meridian_providers::{AdapterRegistry, AnthropicAdapter};
use meridian_router::resolver::{ModelCatalog, Resolver};
use meridian_router::types::{AgentBinding, CapabilitySet, ModelTarget, Pool};
use meridian_router::RouterConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = GatewayConfig::from_env();
    let fleet = default_fleet(&config);

    let (state, report) = bootstrap(config, fleet).await?;
    for check in &report.checks {
        info!(step = check.name, status = ?check.status, detail = %check.detail, "startup");
    }
    let Some(state) = state else {
        error!("Startup failed; refusing to serve");
        anyhow::bail!("startup sequence reported fatal checks");
    };
    if report.is_fatal() {
        anyhow::bail!("startup sequence reported fatal checks");
    }

    // Settlement replay drains the DLQ until shutdown.
    let shutdown = CancellationToken::new();
    let worker = state.worker.clone();
    let replay_cancel = shutdown.clone();
    tokio::spawn(async move {
        worker
            .run(replay_cancel, std::time::Duration::from_secs(30))
            .await;
    });

    let listen_addr = state.config.listen_addr.clone();
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

/// Fleet assembly from environment configuration: the Anthropic
/// adapter when a key is present, a default catalog, pricing, binding,
/// and pool.
fn default_fleet(config: &GatewayConfig) -> FleetSpec {
    let mut registry = AdapterRegistry::new();
    if let Some(api_key) = config.provider_api_keys.get("anthropic") {
        let mut adapter = AnthropicAdapter::new(api_key.clone());
        if let Some(base_url) = config.provider_base_urls.get("anthropic") {
            adapter = adapter.with_base_url(base_url.clone());
        }
        registry.register(Arc::new(adapter));
    }
    for provider in &config.disabled_providers {
        registry.disable(provider);
    }

    let mut catalog = ModelCatalog::new();
    let full = CapabilitySet {
        native_runtime: false,
        tool_calling: true,
        thinking_traces: true,
        vision: true,
        streaming: true,
    };
    catalog.insert(
        "default",
        ModelTarget {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            capabilities: full,
        },
    );
    catalog.insert(
        "opus",
        ModelTarget {
            provider: "anthropic".to_string(),
            model: "claude-opus-4-20250514".to_string(),
            capabilities: full,
        },
    );

    let mut pricing = PricingTable::new();
    pricing.insert(
        "anthropic",
        "claude-sonnet-4-20250514",
        PricingEntry::new(3_000_000, 15_000_000),
    );
    pricing.insert(
        "anthropic",
        "claude-opus-4-20250514",
        PricingEntry::new(15_000_000, 75_000_000),
    );

    let resolver = Resolver::new(catalog, registry, pricing)
        .with_fallback_chains(config.fallback_chains.clone())
        .with_downgrade_chains(config.downgrade_chains.clone());

    let default_pool = Pool {
        id: PoolId::new("default").expect("static pool id"),
        provider: "anthropic".to_string(),
        model: "claude-sonnet-4-20250514".to_string(),
        tier_access: vec!["standard".to_string()],
    };

    FleetSpec {
        resolver,
        bindings: vec![AgentBinding::new(
            &config.default_model_alias,
            &config.default_model_alias,
        )],
        pools: vec![default_pool],
        router_config: RouterConfig {
            budget_policy: config.budget_policy,
            retain_routing_logs: config.retain_routing_logs,
            ..RouterConfig::default()
        },
    }
}
