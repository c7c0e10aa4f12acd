//! Adapter trait and registry

use crate::types::{ProviderError, ProviderRequest, ProviderResponse, ProviderType, Result, StreamChunk};
use async_trait::async_trait;
use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

/// Boxed chunk stream handed back by `stream`.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// One upstream provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider name (registry key, pool `provider` field).
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    /// Cheap health signal for fallback decisions.
    fn is_healthy(&self) -> bool {
        true
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse>;

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkStream>;
}

/// Fleet registry, keyed by provider name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    disabled: HashSet<String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn disable(&mut self, provider: &str) {
        self.disabled.insert(provider.to_string());
    }

    pub fn is_disabled(&self, provider: &str) -> bool {
        self.disabled.contains(provider)
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>> {
        if self.is_disabled(provider) {
            return Err(ProviderError::Unavailable(format!(
                "provider {} is disabled",
                provider
            )));
        }
        self.adapters
            .get(provider)
            .cloned()
            .ok_or_else(|| ProviderError::Unavailable(provider.to_string()))
    }

    /// Lookup that ignores the disabled set, for diagnostics.
    pub fn get_any(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}
