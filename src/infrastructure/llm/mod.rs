use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::domain::types::{ChatMessage, MessageRole, Tool, ToolCall, Usage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("failed to build LLM HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid proxy URL {proxy}: {source}")]
    Proxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("LLM request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode LLM response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// The opaque streaming chat interface the agent loop drives. Implementors
/// assemble one full assistant message from the stream and report usage when
/// the provider includes it.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<(ChatMessage, Option<Usage>), LlmError>;
}

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct LlmClient {
    api_base: String,
    api_key: String,
    model: String,
    stream: bool,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        api_base: &str,
        api_key: &str,
        model: &str,
        proxy: Option<&str>,
        stream: bool,
    ) -> Result<Self, LlmError> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            let proxy_url = reqwest::Proxy::all(proxy).map_err(|source| LlmError::Proxy {
                proxy: proxy.to_string(),
                source,
            })?;
            builder = builder.proxy(proxy_url);
        }
        let client = builder.build().map_err(LlmError::Client)?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            stream,
            client,
        })
    }

    fn request(&self, body: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        request
    }

    async fn chat_once(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<(ChatMessage, Option<Usage>), LlmError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream: false,
            stream_options: None,
        };

        let response = self.request(&body).send().await.map_err(LlmError::Request)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let raw = response.bytes().await.map_err(LlmError::Request)?;
        let decoded: ChatCompletionResponse =
            serde_json::from_slice(&raw).map_err(LlmError::Decode)?;
        let message = decoded
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .unwrap_or_else(|| ChatMessage::new(MessageRole::Assistant, ""));
        if !message.content.is_empty() {
            on_delta(&message.content);
        }
        Ok((message, decoded.usage))
    }

    async fn chat_streaming(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<(ChatMessage, Option<Usage>), LlmError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        let response = self.request(&body).send().await.map_err(LlmError::Request)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut assembly = Assembly::default();
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(LlmError::Request)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
                else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    break 'outer;
                }
                // Malformed keep-alive chunks are skipped, matching the
                // provider-tolerant behavior of every client in the wild.
                let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                assembly.apply(parsed, on_delta);
            }
        }

        debug!(
            content_len = assembly.content.len(),
            tool_calls = assembly.tool_calls.len(),
            "assembled streamed response"
        );
        Ok(assembly.finish())
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
        on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<(ChatMessage, Option<Usage>), LlmError> {
        if self.stream {
            self.chat_streaming(messages, tools, on_delta).await
        } else {
            self.chat_once(messages, tools, on_delta).await
        }
    }
}

// Wire types for the chat-completions API.

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Tool]>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<StreamToolCall>,
}

/// A fragment of a tool call; distinct from [`ToolCall`] because streamed
/// fragments carry an `index` and every other field may be absent.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamToolCall {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: StreamFunction,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Accumulates one assistant message from stream deltas. Text concatenates
/// in arrival order; tool-call fragments merge by index, ids and names stick
/// on first sight and argument fragments concatenate.
#[derive(Debug, Default)]
pub(crate) struct Assembly {
    content: String,
    tool_calls: BTreeMap<usize, ToolCall>,
    usage: Option<Usage>,
}

impl Assembly {
    pub fn apply(&mut self, chunk: StreamChunk, on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync)) {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                self.content.push_str(content);
                on_delta(content);
            }
        }

        for fragment in choice.delta.tool_calls {
            let slot = self.tool_calls.entry(fragment.index).or_default();
            if let Some(id) = fragment.id {
                if !id.is_empty() {
                    slot.id = id;
                }
            }
            if let Some(name) = fragment.function.name {
                if !name.is_empty() {
                    slot.function.name = name;
                }
            }
            if let Some(arguments) = fragment.function.arguments {
                slot.function.arguments.push_str(&arguments);
            }
        }
    }

    pub fn finish(self) -> (ChatMessage, Option<Usage>) {
        let mut message = ChatMessage::new(MessageRole::Assistant, self.content);
        if let Some(max_index) = self.tool_calls.keys().next_back().copied() {
            // Index order with gaps preserved as default entries.
            let mut calls = vec![ToolCall::default(); max_index + 1];
            for (index, call) in self.tool_calls {
                calls[index] = call;
            }
            message.tool_calls = calls;
        }
        (message, self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(json: serde_json::Value) -> StreamChunk {
        serde_json::from_value(json).expect("chunk")
    }

    fn sink() -> impl Fn(&str) + Send + Sync {
        |_: &str| {}
    }

    #[test]
    fn fragmented_tool_call_assembles_atomically() {
        let mut assembly = Assembly::default();
        let deltas = [
            serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "X", "function": {"name": "foo"}}
            ]}}]}),
            serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"a\""}}
            ]}}]}),
            serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":1}"}}
            ]}}]}),
        ];
        let on_delta = sink();
        for delta in deltas {
            assembly.apply(chunk(delta), &on_delta);
        }

        let (message, _) = assembly.finish();
        assert_eq!(message.tool_calls.len(), 1);
        let call = &message.tool_calls[0];
        assert_eq!(call.id, "X");
        assert_eq!(call.function.name, "foo");
        assert_eq!(call.function.arguments, "{\"a\":1}");
    }

    #[test]
    fn text_deltas_concatenate_in_arrival_order() {
        let mut assembly = Assembly::default();
        let seen = std::sync::Mutex::new(Vec::new());
        let on_delta = |delta: &str| seen.lock().unwrap().push(delta.to_string());

        for text in ["Hel", "lo ", "world"] {
            assembly.apply(
                chunk(serde_json::json!({"choices": [{"delta": {"content": text}}]})),
                &on_delta,
            );
        }

        let (message, _) = assembly.finish();
        assert_eq!(message.content, "Hello world");
        assert_eq!(seen.lock().unwrap().join(""), "Hello world");
    }

    #[test]
    fn index_gaps_become_default_entries() {
        let mut assembly = Assembly::default();
        let on_delta = sink();
        assembly.apply(
            chunk(serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 2, "id": "c", "function": {"name": "third"}}
            ]}}]})),
            &on_delta,
        );
        assembly.apply(
            chunk(serde_json::json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "a", "function": {"name": "first"}}
            ]}}]})),
            &on_delta,
        );

        let (message, _) = assembly.finish();
        assert_eq!(message.tool_calls.len(), 3);
        assert_eq!(message.tool_calls[0].function.name, "first");
        assert_eq!(message.tool_calls[1].function.name, "");
        assert_eq!(message.tool_calls[2].function.name, "third");
    }

    #[test]
    fn usage_is_taken_from_any_chunk() {
        let mut assembly = Assembly::default();
        let on_delta = sink();
        assembly.apply(
            chunk(serde_json::json!({
                "choices": [],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            })),
            &on_delta,
        );
        let (_, usage) = assembly.finish();
        assert_eq!(usage.expect("usage").total_tokens, 15);
    }
}
