pub mod truncate;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::router::ToolExecutor;
use crate::domain::types::{ChatMessage, Tool, Usage};
use crate::infrastructure::llm::{ChatBackend, LlmError};

use self::truncate::truncate_messages;

/// Hard bound on LLM round-trips per run.
pub const MAX_ITERATIONS: usize = 25;

/// Tool results larger than this are cut before being fed back to the model.
const MAX_RESULT_BYTES: usize = 4000;

const CANCELED_RESULT: &str = "Operation canceled by user";

/// Asked before a dangerous-looking tool call executes; may block for a long
/// time while a human decides. Returning false skips the call.
#[async_trait]
pub trait ConfirmHook: Send + Sync {
    async fn confirm(&self, tool_name: &str, args_json: &str) -> bool;
}

/// Typed events emitted while a run progresses, in emission order.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ContentDelta { delta: String },
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, result: String },
    Content { text: String },
    Usage { usage: Usage },
}

impl AgentEvent {
    /// The SSE event name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::ContentDelta { .. } => "content_delta",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::Content { .. } => "content",
            AgentEvent::Usage { .. } => "usage",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            AgentEvent::ContentDelta { delta } => json!({ "delta": delta }),
            AgentEvent::ToolCall { name, arguments } => {
                json!({ "name": name, "arguments": arguments })
            }
            AgentEvent::ToolResult { name, result } => {
                json!({ "name": name, "result": result })
            }
            AgentEvent::Content { text } => json!({ "text": text }),
            AgentEvent::Usage { usage } => serde_json::to_value(usage).unwrap_or(Value::Null),
        }
    }
}

pub type EventSink<'a> = &'a (dyn Fn(AgentEvent) + Send + Sync);

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("max iterations ({0}) reached")]
    IterationCap(usize),
    #[error("run canceled")]
    Canceled,
}

const DANGEROUS_NAME_PATTERNS: &[&str] = &["delete", "remove", "destroy", "drop", "purge", "reset"];
const DANGEROUS_ARG_PATTERNS: &[&str] = &["\"delete\"", "\"put\"", "\"patch\""];

/// Conservative lexical test for calls that should be confirmed by a human.
/// No semantic understanding of the arguments is attempted.
pub fn is_dangerous(tool_name: &str, args_json: &str) -> bool {
    let name = tool_name.to_lowercase();
    if DANGEROUS_NAME_PATTERNS.iter().any(|p| name.contains(p)) {
        return true;
    }
    let args = args_json.to_lowercase();
    DANGEROUS_ARG_PATTERNS.iter().any(|p| args.contains(p))
}

/// The bounded LLM/tool dialogue: send history plus tools, assemble the
/// streamed reply, execute requested tools in order, append their results
/// and repeat until the model stops calling tools.
pub struct AgentLoop<B, E> {
    backend: Arc<B>,
    executor: Arc<E>,
    max_ctx_tokens: i64,
}

impl<B: ChatBackend, E: ToolExecutor> AgentLoop<B, E> {
    pub fn new(backend: Arc<B>, executor: Arc<E>) -> Self {
        Self {
            backend,
            executor,
            max_ctx_tokens: 0,
        }
    }

    pub fn set_max_context_tokens(&mut self, tokens: i64) {
        self.max_ctx_tokens = tokens;
    }

    /// Runs to completion, mutating `messages` in place so callers can
    /// persist partial progress on every exit path.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        messages: &mut Vec<ChatMessage>,
        tools: &[Tool],
        auth_token: &str,
        confirm: Option<&dyn ConfirmHook>,
        on_event: EventSink<'_>,
    ) -> Result<Usage, LoopError> {
        let mut usage = Usage::default();

        for iteration in 0..MAX_ITERATIONS {
            if cancel.is_cancelled() {
                return Err(LoopError::Canceled);
            }

            let truncated = truncate_messages(messages, self.max_ctx_tokens);
            debug!(
                iteration,
                history = truncated.len(),
                tools = tools.len(),
                "calling LLM"
            );

            let on_delta = |delta: &str| {
                on_event(AgentEvent::ContentDelta {
                    delta: delta.to_string(),
                });
            };
            let (message, call_usage) = tokio::select! {
                result = self.backend.chat_stream(&truncated, tools, &on_delta) => result?,
                _ = cancel.cancelled() => return Err(LoopError::Canceled),
            };

            if let Some(call_usage) = call_usage {
                usage.add(call_usage);
            }

            messages.push(message.clone());

            if message.tool_calls.is_empty() {
                on_event(AgentEvent::Content {
                    text: message.content.clone(),
                });
                if !usage.is_zero() {
                    on_event(AgentEvent::Usage { usage });
                }
                return Ok(usage);
            }

            // Tool calls run strictly in the order the model returned them.
            for call in &message.tool_calls {
                let name = call.function.name.clone();
                let arguments = call.function.arguments.clone();

                on_event(AgentEvent::ToolCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                });

                if let Some(confirm) = confirm {
                    if is_dangerous(&name, &arguments) && !confirm.confirm(&name, &arguments).await
                    {
                        info!(tool = %name, "dangerous call declined");
                        on_event(AgentEvent::ToolResult {
                            name: name.clone(),
                            result: CANCELED_RESULT.to_string(),
                        });
                        messages.push(ChatMessage::tool_reply(&call.id, CANCELED_RESULT));
                        continue;
                    }
                }

                let result = match self.executor.execute(&name, &arguments, auth_token).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(tool = %name, %err, "tool execution failed");
                        format!("Error: {err}")
                    }
                };
                let result = truncate_result(result);

                on_event(AgentEvent::ToolResult {
                    name,
                    result: result.clone(),
                });
                messages.push(ChatMessage::tool_reply(&call.id, result));
            }
        }

        if !usage.is_zero() {
            on_event(AgentEvent::Usage { usage });
        }
        Err(LoopError::IterationCap(MAX_ITERATIONS))
    }
}

/// Cuts a tool result at a character boundary at or below the byte limit.
fn truncate_result(result: String) -> String {
    if result.len() <= MAX_RESULT_BYTES {
        return result;
    }
    let mut cut = MAX_RESULT_BYTES;
    while !result.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n...(truncated)", &result[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::router::RouterError;
    use crate::domain::types::{FunctionCall, MessageRole, ToolCall};
    use std::sync::Mutex;

    /// Backend scripted with a fixed sequence of replies.
    struct ScriptedBackend {
        replies: Mutex<Vec<(ChatMessage, Option<Usage>)>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<(ChatMessage, Option<Usage>)>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _tools: &[Tool],
            on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        ) -> Result<(ChatMessage, Option<Usage>), LlmError> {
            let mut replies = self.replies.lock().unwrap();
            let (message, usage) = if replies.is_empty() {
                (ChatMessage::new(MessageRole::Assistant, "fallback"), None)
            } else {
                replies.remove(0)
            };
            if !message.content.is_empty() {
                on_delta(&message.content);
            }
            Ok((message, usage))
        }
    }

    /// Backend that always requests the same tool; used to hit the cap.
    struct RelentlessBackend;

    #[async_trait]
    impl ChatBackend for RelentlessBackend {
        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _tools: &[Tool],
            _on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        ) -> Result<(ChatMessage, Option<Usage>), LlmError> {
            Ok((assistant_calling("c1", "svc__ping", "{}"), None))
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<(String, String)>>,
        result: Option<String>,
    }

    #[async_trait]
    impl ToolExecutor for RecordingExecutor {
        async fn execute(
            &self,
            tool_name: &str,
            args_json: &str,
            _auth_token: &str,
        ) -> Result<String, RouterError> {
            self.calls
                .lock()
                .unwrap()
                .push((tool_name.to_string(), args_json.to_string()));
            Ok(self.result.clone().unwrap_or_else(|| "ok".to_string()))
        }
    }

    struct DenyAll;

    #[async_trait]
    impl ConfirmHook for DenyAll {
        async fn confirm(&self, _tool_name: &str, _args_json: &str) -> bool {
            false
        }
    }

    fn assistant_calling(id: &str, name: &str, args: &str) -> ChatMessage {
        let mut m = ChatMessage::new(MessageRole::Assistant, "");
        m.tool_calls = vec![ToolCall {
            id: id.into(),
            kind: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: args.into(),
            },
        }];
        m
    }

    fn collect_events() -> (Arc<Mutex<Vec<AgentEvent>>>, impl Fn(AgentEvent) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            move |event: AgentEvent| events.lock().unwrap().push(event)
        };
        (events, sink)
    }

    #[tokio::test]
    async fn plain_answer_finishes_in_one_iteration() {
        let backend = Arc::new(ScriptedBackend::new(vec![(
            ChatMessage::new(MessageRole::Assistant, "hello"),
            Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            }),
        )]));
        let executor = Arc::new(RecordingExecutor::default());
        let agent = AgentLoop::new(backend, executor.clone());

        let (events, sink) = collect_events();
        let mut messages = vec![ChatMessage::new(MessageRole::User, "hi")];
        let usage = agent
            .run(
                &CancellationToken::new(),
                &mut messages,
                &[],
                "",
                None,
                &sink,
            )
            .await
            .expect("run");

        assert_eq!(usage.total_tokens, 5);
        assert_eq!(messages.len(), 2);
        assert!(executor.calls.lock().unwrap().is_empty());

        let events = events.lock().unwrap();
        let names: Vec<&str> = events.iter().map(AgentEvent::name).collect();
        assert_eq!(names, vec!["content_delta", "content", "usage"]);
    }

    #[tokio::test]
    async fn tool_round_trip_appends_tool_reply_then_final_answer() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            (assistant_calling("c1", "svc__lookup", "{\"id\":1}"), None),
            (ChatMessage::new(MessageRole::Assistant, "found it"), None),
        ]));
        let executor = Arc::new(RecordingExecutor::default());
        let agent = AgentLoop::new(backend, executor.clone());

        let (events, sink) = collect_events();
        let mut messages = vec![ChatMessage::new(MessageRole::User, "look up 1")];
        agent
            .run(
                &CancellationToken::new(),
                &mut messages,
                &[],
                "tok",
                None,
                &sink,
            )
            .await
            .expect("run");

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].tool_calls[0].function.name, "svc__lookup");
        assert_eq!(messages[2].role, MessageRole::Tool);
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[2].content, "ok");
        assert_eq!(messages[3].content, "found it");

        let names: Vec<&str> = events.lock().unwrap().iter().map(AgentEvent::name).collect();
        assert_eq!(
            names,
            vec!["tool_call", "tool_result", "content_delta", "content"]
        );
    }

    #[tokio::test]
    async fn declined_dangerous_call_never_reaches_the_executor() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            (
                assistant_calling("c1", "petstore__delete_pet", "{\"id\":\"1\"}"),
                None,
            ),
            (ChatMessage::new(MessageRole::Assistant, "stopped"), None),
        ]));
        let executor = Arc::new(RecordingExecutor::default());
        let agent = AgentLoop::new(backend, executor.clone());

        let (_, sink) = collect_events();
        let mut messages = vec![ChatMessage::new(MessageRole::User, "delete pet 1")];
        agent
            .run(
                &CancellationToken::new(),
                &mut messages,
                &[],
                "",
                Some(&DenyAll),
                &sink,
            )
            .await
            .expect("run");

        assert!(executor.calls.lock().unwrap().is_empty());
        assert_eq!(messages[2].role, MessageRole::Tool);
        assert_eq!(messages[2].content, "Operation canceled by user");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn iteration_cap_returns_an_error() {
        let backend = Arc::new(RelentlessBackend);
        let executor = Arc::new(RecordingExecutor::default());
        let agent = AgentLoop::new(backend, executor.clone());

        let (_, sink) = collect_events();
        let mut messages = vec![ChatMessage::new(MessageRole::User, "go")];
        let err = agent
            .run(
                &CancellationToken::new(),
                &mut messages,
                &[],
                "",
                None,
                &sink,
            )
            .await
            .expect_err("cap");

        assert!(matches!(err, LoopError::IterationCap(MAX_ITERATIONS)));
        assert_eq!(executor.calls.lock().unwrap().len(), MAX_ITERATIONS);
        // Partial progress stays in the message list for persistence.
        assert_eq!(messages.len(), 1 + 2 * MAX_ITERATIONS);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_llm_call() {
        let backend = Arc::new(RelentlessBackend);
        let executor = Arc::new(RecordingExecutor::default());
        let agent = AgentLoop::new(backend, executor);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_, sink) = collect_events();
        let mut messages = vec![ChatMessage::new(MessageRole::User, "go")];
        let err = agent
            .run(&cancel, &mut messages, &[], "", None, &sink)
            .await
            .expect_err("canceled");
        assert!(matches!(err, LoopError::Canceled));
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn long_results_are_truncated_for_the_model() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            (assistant_calling("c1", "svc__dump", "{}"), None),
            (ChatMessage::new(MessageRole::Assistant, "done"), None),
        ]));
        let executor = Arc::new(RecordingExecutor {
            calls: Mutex::new(Vec::new()),
            result: Some("x".repeat(5000)),
        });
        let agent = AgentLoop::new(backend, executor);

        let (_, sink) = collect_events();
        let mut messages = vec![ChatMessage::new(MessageRole::User, "dump")];
        agent
            .run(
                &CancellationToken::new(),
                &mut messages,
                &[],
                "",
                None,
                &sink,
            )
            .await
            .expect("run");

        let reply = &messages[2].content;
        assert!(reply.ends_with("\n...(truncated)"));
        assert!(reply.len() < 4100);
    }

    #[test]
    fn danger_heuristic_matches_names_and_arguments() {
        for name in ["svc__delete_pet", "REMOVE_user", "db__DropTable", "reset_all"] {
            assert!(is_dangerous(name, "{}"), "{name} should be dangerous");
        }
        assert!(is_dangerous("svc__update", r#"{"method":"DELETE"}"#));
        assert!(is_dangerous("svc__update", r#"{"method":"put"}"#));
        assert!(is_dangerous("svc__update", r#"{"method":"Patch"}"#));
        assert!(!is_dangerous("svc__list", r#"{"q":"deletions"}"#));
        assert!(!is_dangerous("svc__get", "{}"));
    }

    #[test]
    fn result_truncation_respects_char_boundaries() {
        let result = "é".repeat(2500);
        let truncated = truncate_result(result);
        assert!(truncated.ends_with("\n...(truncated)"));
        assert!(truncated.len() <= MAX_RESULT_BYTES + 16);
    }
}
