//! Mock adapters for tests
//!
//! Scripted responses and streams with configurable latency, plus call
//! tracking, so router and ensemble behavior can be exercised without a
//! network.

use crate::adapter::{ChunkStream, ProviderAdapter};
use crate::types::{
    ProviderError, ProviderRequest, ProviderResponse, ProviderType, Result, StreamChunk,
};
use async_trait::async_trait;
use meridian_core::Usage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One scripted outcome for a `complete` call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Respond(ProviderResponse),
    Fail { status: u16, message: String },
    RateLimited,
}

pub struct MockAdapter {
    name: String,
    provider_type: ProviderType,
    healthy: AtomicBool,
    delay: Duration,
    outcomes: Mutex<VecDeque<MockOutcome>>,
    stream_scripts: Mutex<VecDeque<Vec<StreamChunk>>>,
    /// Delay before each emitted stream chunk.
    chunk_delay: Duration,
    calls: Mutex<Vec<ProviderRequest>>,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            provider_type: ProviderType::Mock,
            healthy: AtomicBool::new(true),
            delay: Duration::ZERO,
            outcomes: Mutex::new(VecDeque::new()),
            stream_scripts: Mutex::new(VecDeque::new()),
            chunk_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_provider_type(mut self, provider_type: ProviderType) -> Self {
        self.provider_type = provider_type;
        self
    }

    /// Latency before `complete` resolves (race tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn push_response(&self, response: ProviderResponse) {
        self.outcomes.lock().push_back(MockOutcome::Respond(response));
    }

    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn push_stream(&self, chunks: Vec<StreamChunk>) {
        self.stream_scripts.lock().push_back(chunks);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<ProviderRequest> {
        self.calls.lock().clone()
    }

    /// Convenience: a plain text response with the given usage.
    pub fn text_response(
        content: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> ProviderResponse {
        ProviderResponse {
            content: content.to_string(),
            model: model.to_string(),
            usage: Usage::new(input_tokens, output_tokens),
            finish_reason: "end_turn".to_string(),
            tool_calls: Vec::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        self.calls.lock().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidResponse("mock script exhausted".to_string()))?;
        match outcome {
            MockOutcome::Respond(response) => Ok(response),
            MockOutcome::Fail { status, message } => Err(ProviderError::Api { status, message }),
            MockOutcome::RateLimited => Err(ProviderError::RateLimited),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkStream> {
        self.calls.lock().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let chunks = self
            .stream_scripts
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidResponse("mock stream script exhausted".to_string()))?;
        let chunk_delay = self.chunk_delay;

        let stream = futures::stream::unfold(
            (VecDeque::from(chunks), chunk_delay),
            |(mut chunks, delay)| async move {
                let chunk = chunks.pop_front()?;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(chunk), (chunks, delay)))
            },
        );
        Ok(Box::pin(stream))
    }
}
