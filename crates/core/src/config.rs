//! Environment configuration
//!
//! One typed snapshot of every knob the gateway reads from the
//! environment. Parsing is lenient; `validate` is where startup decides
//! what is fatal.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        "CONFIG_INVALID"
    }
}

/// How the router reacts when a scope's budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicy {
    /// Refuse the request outright.
    #[default]
    Reject,
    /// Walk the downgrade chain to a cheaper model.
    Downgrade,
}

/// Deployment mode; protocol incompatibility is fatal only in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub environment: Environment,
    /// Authoritative durable-store URL (`mem://` in tests).
    pub store_url: String,
    /// External billing service base URL.
    pub settlement_base_url: String,
    /// Issuer/audience/key for the signed settlement token.
    pub settlement_issuer: String,
    pub settlement_audience: String,
    /// PEM-encoded ES256 private key for settlement tokens.
    pub settlement_signing_key_pem: Option<String>,
    /// Provider base URLs and API keys, keyed by provider name.
    pub provider_base_urls: HashMap<String, String>,
    pub provider_api_keys: HashMap<String, String>,
    /// Routing defaults.
    pub default_model_alias: String,
    pub budget_policy: BudgetPolicy,
    pub fallback_chains: HashMap<String, Vec<String>>,
    pub downgrade_chains: HashMap<String, Vec<String>>,
    pub disabled_providers: HashSet<String>,
    /// Whether routing decision logs are retained in the store.
    pub retain_routing_logs: bool,
    pub listen_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            store_url: "mem://".to_string(),
            settlement_base_url: "http://localhost:4010".to_string(),
            settlement_issuer: "meridian-gateway".to_string(),
            settlement_audience: "billing-service".to_string(),
            settlement_signing_key_pem: None,
            provider_base_urls: HashMap::new(),
            provider_api_keys: HashMap::new(),
            default_model_alias: "default".to_string(),
            budget_policy: BudgetPolicy::Reject,
            fallback_chains: HashMap::new(),
            downgrade_chains: HashMap::new(),
            disabled_providers: HashSet::new(),
            retain_routing_logs: true,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Build a config from process environment variables.
    ///
    /// `MERIDIAN_FALLBACK_CHAINS` / `MERIDIAN_DOWNGRADE_CHAINS` are JSON
    /// maps of alias → alias list; a parse failure there is fail-open
    /// (empty table, warning) because chains are routing knowledge, not
    /// money.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("MERIDIAN_ENV") {
            if v.eq_ignore_ascii_case("production") {
                config.environment = Environment::Production;
            }
        }
        if let Ok(v) = env::var("MERIDIAN_STORE_URL") {
            config.store_url = v;
        }
        if let Ok(v) = env::var("MERIDIAN_SETTLEMENT_URL") {
            config.settlement_base_url = v;
        }
        if let Ok(v) = env::var("MERIDIAN_SETTLEMENT_ISSUER") {
            config.settlement_issuer = v;
        }
        if let Ok(v) = env::var("MERIDIAN_SETTLEMENT_AUDIENCE") {
            config.settlement_audience = v;
        }
        if let Ok(v) = env::var("MERIDIAN_SETTLEMENT_SIGNING_KEY") {
            config.settlement_signing_key_pem = Some(v);
        }
        if let Ok(v) = env::var("MERIDIAN_DEFAULT_MODEL") {
            config.default_model_alias = v;
        }
        if let Ok(v) = env::var("MERIDIAN_BUDGET_POLICY") {
            if v.eq_ignore_ascii_case("downgrade") {
                config.budget_policy = BudgetPolicy::Downgrade;
            }
        }
        if let Ok(v) = env::var("MERIDIAN_DISABLED_PROVIDERS") {
            config.disabled_providers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = env::var("MERIDIAN_RETAIN_ROUTING_LOGS") {
            config.retain_routing_logs = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Ok(v) = env::var("MERIDIAN_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Ok(v) = env::var("ANTHROPIC_API_KEY") {
            config
                .provider_api_keys
                .insert("anthropic".to_string(), v);
        }
        if let Ok(v) = env::var("ANTHROPIC_BASE_URL") {
            config
                .provider_base_urls
                .insert("anthropic".to_string(), v);
        }

        config.fallback_chains = parse_chain_table("MERIDIAN_FALLBACK_CHAINS");
        config.downgrade_chains = parse_chain_table("MERIDIAN_DOWNGRADE_CHAINS");

        config
    }

    /// Hard validation; startup treats any error here as fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_url.is_empty() {
            return Err(ConfigError::Invalid("store URL is empty".to_string()));
        }
        if self.default_model_alias.is_empty() {
            return Err(ConfigError::Invalid(
                "default model alias is empty".to_string(),
            ));
        }
        if self.environment == Environment::Production
            && self.settlement_signing_key_pem.is_none()
        {
            return Err(ConfigError::Invalid(
                "production requires a settlement signing key".to_string(),
            ));
        }
        for (alias, chain) in self.fallback_chains.iter().chain(&self.downgrade_chains) {
            if chain.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "chain for alias {} is empty",
                    alias
                )));
            }
        }
        Ok(())
    }
}

fn parse_chain_table(var: &str) -> HashMap<String, Vec<String>> {
    let Ok(raw) = env::var(var) else {
        return HashMap::new();
    };
    match serde_json::from_str(&raw) {
        Ok(table) => table,
        Err(e) => {
            tracing::warn!(var = %var, error = %e, "Chain table unparseable, continuing with empty table");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_production_requires_signing_key() {
        let config = GatewayConfig {
            environment: Environment::Production,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_chain_rejected() {
        let mut config = GatewayConfig::default();
        config
            .fallback_chains
            .insert("default".to_string(), Vec::new());
        assert!(config.validate().is_err());
    }
}
