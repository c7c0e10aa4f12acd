//! Canonical provider-facing types
//!
//! One internal request shape; each adapter owns the translation to its
//! provider's wire format.

use meridian_core::{CorrelationId, TraceId, Usage};
use serde::{Deserialize, Serialize};

/// Provider error types
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Provider disabled or unknown: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Cancellation is not a failure; callers must keep it out of
    /// error counters.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// What kind of adapter serves a provider. `ClaudeCode` hosts the model
/// in-process; agents marked native-runtime may only bind there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    Anthropic,
    OpenAi,
    ClaudeCode,
    Mock,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::ClaudeCode => "claude-code",
            Self::Mock => "mock",
        }
    }

    pub fn is_native_runtime(&self) -> bool {
        matches!(self, Self::ClaudeCode)
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool invocations the assistant asked for on this turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Role::Tool` messages: which call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Derive the argument schema from a Rust type.
    pub fn for_type<T: schemars::JsonSchema>(name: &str, description: &str) -> Self {
        let schema = schemars::schema_for!(T);
        let parameters = serde_json::to_value(schema.schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// An invocation the model requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text; may be malformed and need a repair round.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
}

/// Sampling and limit knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop_sequences: Vec<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: Some(4096),
            top_p: None,
            stop_sequences: Vec::new(),
        }
    }
}

/// Canonical request handed to an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    pub options: RequestOptions,
    pub trace_id: TraceId,
    pub correlation_id: CorrelationId,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            options: RequestOptions::default(),
            trace_id: TraceId::random(),
            correlation_id: CorrelationId::random(),
        }
    }

    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }
}

/// Completed (non-streaming) response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Typed streaming event, one per provider SSE event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Metadata: the stream opened.
    MessageStart { model: String },
    /// A text delta.
    Text { delta: String },
    /// A tool-call delta (id/name on the first fragment, then argument
    /// JSON fragments).
    ToolCallDelta {
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// A content block finished.
    ContentBlockStop,
    /// Usage / stop-reason metadata near the end of the stream.
    UsageDelta {
        usage: Usage,
        stop_reason: Option<String>,
    },
    /// The stream is complete.
    MessageStop,
    /// Provider-reported stream error.
    StreamError { message: String },
}

impl StreamChunk {
    /// Content-bearing chunks decide streaming races; metadata does
    /// not. Tool-call deltas count as content.
    pub fn is_content_bearing(&self) -> bool {
        matches!(self, Self::Text { .. } | Self::ToolCallDelta { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;

    #[derive(JsonSchema)]
    #[allow(dead_code)]
    struct LookupArgs {
        /// Search query
        q: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_tool_definition_from_type() {
        let tool = ToolDefinition::for_type::<LookupArgs>("lookup", "Search the index");
        assert_eq!(tool.name, "lookup");
        assert!(tool.parameters["properties"]["q"].is_object());
        assert!(tool.parameters["properties"]["limit"].is_object());
    }

    #[test]
    fn test_content_bearing_chunks() {
        assert!(StreamChunk::Text { delta: "x".to_string() }.is_content_bearing());
        assert!(StreamChunk::ToolCallDelta {
            id: None,
            name: None,
            arguments_delta: "{".to_string()
        }
        .is_content_bearing());
        assert!(!StreamChunk::MessageStart { model: "m".to_string() }.is_content_bearing());
        assert!(!StreamChunk::MessageStop.is_content_bearing());
    }
}
