//! Meridian Providers - Upstream model adapters
//!
//! The canonical request/response vocabulary, the `ProviderAdapter`
//! seam, the Anthropic-compatible wire adapter, and scripted mocks.

pub mod adapter;
pub mod anthropic;
pub mod mock;
pub mod retry;
pub mod types;

pub use adapter::{AdapterRegistry, ChunkStream, ProviderAdapter};
pub use anthropic::AnthropicAdapter;
pub use mock::{MockAdapter, MockOutcome};
pub use retry::{is_retryable_status, RetryPolicy};
pub use types::{
    Message, ProviderError, ProviderRequest, ProviderResponse, ProviderType, RequestOptions,
    Result, Role, StreamChunk, ToolCall, ToolChoice, ToolDefinition,
};
