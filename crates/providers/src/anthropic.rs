//! Anthropic-compatible adapter
//!
//! Translates the canonical request into the Messages API wire format
//! and decodes its server-sent-event stream into typed chunks.

use crate::adapter::{ChunkStream, ProviderAdapter};
use crate::retry::{is_retryable_status, RetryPolicy};
use crate::types::{
    Message, ProviderError, ProviderRequest, ProviderResponse, ProviderType, Result, Role,
    StreamChunk, ToolCall, ToolChoice,
};
use async_trait::async_trait;
use futures::StreamExt;
use meridian_core::Usage;
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub struct AnthropicAdapter {
    name: String,
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            name: "anthropic".to_string(),
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the Messages API body from the canonical request.
    fn build_request_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.options.max_tokens.unwrap_or(4096),
            "temperature": request.options.temperature,
            "messages": convert_messages(&request.messages),
        });

        // System turns collapse into the top-level system parameter.
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        if let Some(top_p) = request.options.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.options.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(request.options.stop_sequences);
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
            match request.tool_choice {
                ToolChoice::Auto => body["tool_choice"] = json!({"type": "auto"}),
                ToolChoice::Required => body["tool_choice"] = json!({"type": "any"}),
                // None: omit the field entirely.
                ToolChoice::None => {}
            }
        }

        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await?;

            let status = response.status().as_u16();
            if response.status().is_success() {
                return Ok(response);
            }

            if is_retryable_status(status) && attempt <= self.retry.max_retries {
                let delay = self.retry.delay_for(attempt);
                warn!(status = status, attempt = attempt, delay_ms = delay.as_millis() as u64, "Retryable provider status, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }

            let message = response.text().await.unwrap_or_default();
            return Err(match status {
                429 => ProviderError::RateLimited,
                _ => ProviderError::Api { status, message },
            });
        }
    }
}

/// Convert canonical messages into Messages API turns.
///
/// Assistant tool calls become tool_use content blocks; tool-role
/// results become user-role tool_result blocks, with consecutive
/// results merged into a single user message.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();

    let flush_results = |out: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            out.push(json!({
                "role": "user",
                "content": std::mem::take(pending),
            }));
        }
    };

    for message in messages {
        match message.role {
            // System turns are lifted out by the caller.
            Role::System => {}
            Role::User => {
                flush_results(&mut out, &mut pending_results);
                out.push(json!({"role": "user", "content": message.content}));
            }
            Role::Assistant => {
                flush_results(&mut out, &mut pending_results);
                if message.tool_calls.is_empty() {
                    out.push(json!({"role": "assistant", "content": message.content}));
                } else {
                    let mut blocks: Vec<Value> = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": message.content}));
                    }
                    for call in &message.tool_calls {
                        let input: Value = serde_json::from_str(&call.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": input,
                        }));
                    }
                    out.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            Role::Tool => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id,
                    "content": message.content,
                }));
            }
        }
    }
    flush_results(&mut out, &mut pending_results);
    out
}

fn parse_response(body: Value) -> Result<ProviderResponse> {
    let mut content = String::new();
    let mut tool_calls = Vec::new();

    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("missing content array".to_string()))?;
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => {
                content.push_str(block["text"].as_str().unwrap_or_default());
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].to_string(),
                });
            }
            _ => {}
        }
    }

    Ok(ProviderResponse {
        content,
        model: body["model"].as_str().unwrap_or("unknown").to_string(),
        usage: Usage::new(
            body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        ),
        finish_reason: body["stop_reason"].as_str().unwrap_or("unknown").to_string(),
        tool_calls,
    })
}

/// Map one SSE event to typed chunks.
fn map_event(event: &str, data: &Value) -> Vec<StreamChunk> {
    match event {
        "message_start" => vec![StreamChunk::MessageStart {
            model: data["message"]["model"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
        }],
        "content_block_start" => {
            if data["content_block"]["type"].as_str() == Some("tool_use") {
                vec![StreamChunk::ToolCallDelta {
                    id: data["content_block"]["id"].as_str().map(String::from),
                    name: data["content_block"]["name"].as_str().map(String::from),
                    arguments_delta: String::new(),
                }]
            } else {
                Vec::new()
            }
        }
        "content_block_delta" => match data["delta"]["type"].as_str() {
            Some("text_delta") => vec![StreamChunk::Text {
                delta: data["delta"]["text"].as_str().unwrap_or_default().to_string(),
            }],
            Some("input_json_delta") => vec![StreamChunk::ToolCallDelta {
                id: None,
                name: None,
                arguments_delta: data["delta"]["partial_json"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            }],
            _ => Vec::new(),
        },
        "content_block_stop" => vec![StreamChunk::ContentBlockStop],
        "message_delta" => vec![StreamChunk::UsageDelta {
            usage: Usage::new(
                data["usage"]["input_tokens"].as_u64().unwrap_or(0),
                data["usage"]["output_tokens"].as_u64().unwrap_or(0),
            ),
            stop_reason: data["delta"]["stop_reason"].as_str().map(String::from),
        }],
        "message_stop" => vec![StreamChunk::MessageStop],
        "error" => vec![StreamChunk::StreamError {
            message: data["error"]["message"]
                .as_str()
                .unwrap_or("unknown stream error")
                .to_string(),
        }],
        // ping and future event types pass through silently.
        _ => Vec::new(),
    }
}

struct SseDecoder {
    inner: futures::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: String,
    pending: VecDeque<StreamChunk>,
    done: bool,
}

impl SseDecoder {
    /// Cut complete events ("\n\n"-terminated) out of the buffer.
    fn drain_buffer(&mut self) {
        while let Some(boundary) = self.buffer.find("\n\n") {
            let raw_event = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);

            let mut event_name = String::new();
            let mut data = String::new();
            for line in raw_event.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data.push_str(rest.trim());
                }
            }
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&data) {
                Ok(value) => self.pending.extend(map_event(&event_name, &value)),
                Err(e) => {
                    debug!(event = %event_name, error = %e, "Unparseable SSE data line, skipping");
                }
            }
        }
    }
}

fn sse_chunk_stream(response: reqwest::Response) -> ChunkStream {
    let decoder = SseDecoder {
        inner: response.bytes_stream().boxed(),
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(chunk) = decoder.pending.pop_front() {
                return Some((Ok(chunk), decoder));
            }
            if decoder.done {
                return None;
            }
            match decoder.inner.next().await {
                Some(Ok(bytes)) => {
                    decoder.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    decoder.drain_buffer();
                }
                Some(Err(e)) => {
                    decoder.done = true;
                    return Some((Err(ProviderError::Network(e)), decoder));
                }
                None => {
                    decoder.done = true;
                }
            }
        }
    }))
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        let body = self.build_request_body(&request, false);
        let response = self.send(&body).await?;
        let value: Value = response.json().await?;
        parse_response(value)
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkStream> {
        let body = self.build_request_body(&request, true);
        let response = self.send(&body).await?;
        Ok(sse_chunk_stream(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolDefinition;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new("test-key".to_string())
    }

    fn tool() -> ToolDefinition {
        ToolDefinition {
            name: "lookup".to_string(),
            description: "Look something up".to_string(),
            parameters: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
        }
    }

    #[test]
    fn test_system_messages_concatenate() {
        let request = ProviderRequest::new(
            "claude-opus",
            vec![
                Message::system("Be terse."),
                Message::system("Answer in French."),
                Message::user("Bonjour"),
            ],
        );
        let body = adapter().build_request_body(&request, false);
        assert_eq!(body["system"], json!("Be terse.\n\nAnswer in French."));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_tool_definitions_map_to_input_schema() {
        let request = ProviderRequest::new("claude-opus", vec![Message::user("hi")])
            .tools(vec![tool()]);
        let body = adapter().build_request_body(&request, false);
        assert_eq!(body["tools"][0]["name"], "lookup");
        assert!(body["tools"][0]["input_schema"].is_object());
        assert_eq!(body["tool_choice"], json!({"type": "auto"}));
    }

    #[test]
    fn test_tool_choice_mapping() {
        let base = || ProviderRequest::new("m", vec![Message::user("hi")]).tools(vec![tool()]);

        let body = adapter().build_request_body(&base().tool_choice(ToolChoice::Required), false);
        assert_eq!(body["tool_choice"], json!({"type": "any"}));

        let body = adapter().build_request_body(&base().tool_choice(ToolChoice::None), false);
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_tool_results_become_user_blocks_and_merge() {
        let mut assistant = Message::assistant("Let me check.");
        assistant.tool_calls = vec![
            ToolCall {
                id: "tc_1".to_string(),
                name: "lookup".to_string(),
                arguments: r#"{"q":"a"}"#.to_string(),
            },
            ToolCall {
                id: "tc_2".to_string(),
                name: "lookup".to_string(),
                arguments: r#"{"q":"b"}"#.to_string(),
            },
        ];
        let request = ProviderRequest::new(
            "claude-opus",
            vec![
                Message::user("compare a and b"),
                assistant,
                Message::tool_result("tc_1", "result a"),
                Message::tool_result("tc_2", "result b"),
            ],
        );
        let body = adapter().build_request_body(&request, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);

        // Assistant turn carries text + two tool_use blocks.
        let blocks = messages[1]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["input"], json!({"q": "a"}));
        assert_eq!(blocks[2]["id"], "tc_2");

        // Both tool results merged into one user message.
        assert_eq!(messages[2]["role"], "user");
        let results = messages[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["type"], "tool_result");
        assert_eq!(results[0]["tool_use_id"], "tc_1");
        assert_eq!(results[1]["tool_use_id"], "tc_2");
    }

    #[test]
    fn test_parse_response_with_tool_use() {
        let body = json!({
            "model": "claude-opus",
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 34},
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "tc_9", "name": "lookup", "input": {"q": "x"}},
            ],
        });
        let response = parse_response(body).unwrap();
        assert_eq!(response.content, "Checking.");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "tc_9");
        assert_eq!(response.finish_reason, "tool_use");
    }

    #[test]
    fn test_map_stream_events() {
        let start = map_event(
            "message_start",
            &json!({"message": {"model": "claude-opus"}}),
        );
        assert_eq!(
            start,
            vec![StreamChunk::MessageStart {
                model: "claude-opus".to_string()
            }]
        );
        assert!(!start[0].is_content_bearing());

        let text = map_event(
            "content_block_delta",
            &json!({"delta": {"type": "text_delta", "text": "Hel"}}),
        );
        assert_eq!(text, vec![StreamChunk::Text { delta: "Hel".to_string() }]);
        assert!(text[0].is_content_bearing());

        let tool_start = map_event(
            "content_block_start",
            &json!({"content_block": {"type": "tool_use", "id": "tc_1", "name": "lookup"}}),
        );
        assert!(tool_start[0].is_content_bearing());

        let json_delta = map_event(
            "content_block_delta",
            &json!({"delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}}),
        );
        assert_eq!(
            json_delta,
            vec![StreamChunk::ToolCallDelta {
                id: None,
                name: None,
                arguments_delta: "{\"q\":".to_string()
            }]
        );

        let stop = map_event(
            "message_delta",
            &json!({"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 42}}),
        );
        match &stop[0] {
            StreamChunk::UsageDelta { usage, stop_reason } => {
                assert_eq!(usage.output_tokens, 42);
                assert_eq!(stop_reason.as_deref(), Some("end_turn"));
            }
            other => panic!("unexpected chunk {:?}", other),
        }

        assert_eq!(map_event("ping", &json!({})), Vec::<StreamChunk>::new());
        assert_eq!(map_event("message_stop", &json!({})), vec![StreamChunk::MessageStop]);
    }
}
