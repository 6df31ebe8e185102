use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::agent::{AgentLoop, ConfirmHook, EventSink, LoopError};
use crate::application::conversations::{ConversationError, ConversationManager};
use crate::application::router::ToolRouter;
use crate::domain::conversation::Conversation;
use crate::domain::types::{tool_source, ChatMessage, MessageRole, Tool, Usage};
use crate::infrastructure::llm::ChatBackend;

const TITLE_MAX_CHARS: usize = 30;

/// What a chat turn produced. Messages are persisted before this is
/// returned, on success and failure alike.
pub struct ChatOutcome {
    pub conversation_id: String,
    pub usage: Usage,
    pub error: Option<LoopError>,
}

/// Ties the agent loop to the conversation store and the process-wide tool
/// catalog. Hosts (HTTP server, re-export server) only talk to the engine.
pub struct Engine<B> {
    agent: AgentLoop<B, ToolRouter>,
    conversations: Arc<ConversationManager>,
    tools: RwLock<Vec<Tool>>,
    system_prompt: String,
}

impl<B: ChatBackend> Engine<B> {
    pub fn new(
        backend: Arc<B>,
        router: Arc<ToolRouter>,
        conversations: Arc<ConversationManager>,
        tools: Vec<Tool>,
        system_prompt: String,
        max_ctx_tokens: i64,
    ) -> Self {
        let mut agent = AgentLoop::new(backend, router);
        agent.set_max_context_tokens(max_ctx_tokens);
        Self {
            agent,
            conversations,
            tools: RwLock::new(tools),
            system_prompt,
        }
    }

    /// Runs one full chat turn: resolve or create the conversation, append
    /// the user message, drive the loop, persist whatever was produced.
    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        message: &str,
        auth_token: &str,
        confirm: Option<&dyn ConfirmHook>,
        on_event: EventSink<'_>,
    ) -> ChatOutcome {
        let (conv, is_new) = match self.conversations.get(conversation_id) {
            Some(conv) => (conv, false),
            None => (self.conversations.create("", &self.system_prompt), true),
        };

        if is_new {
            self.conversations
                .update_title(&conv.id, &derive_title(message));
        }

        let mut messages = conv.messages.clone();
        messages.push(ChatMessage::new(MessageRole::User, message));

        let enabled_tools = self.filter_tools(&conv);
        let result = self
            .agent
            .run(
                cancel,
                &mut messages,
                &enabled_tools,
                auth_token,
                confirm,
                on_event,
            )
            .await;

        // Partial progress survives errors and cancellation.
        self.conversations.update_messages(&conv.id, messages);

        match result {
            Ok(usage) => {
                info!(conversation = %conv.id, "chat turn completed");
                ChatOutcome {
                    conversation_id: conv.id,
                    usage,
                    error: None,
                }
            }
            Err(error) => {
                warn!(conversation = %conv.id, %error, "chat turn ended with error");
                ChatOutcome {
                    conversation_id: conv.id,
                    usage: Usage::default(),
                    error: Some(error),
                }
            }
        }
    }

    /// Re-runs the loop on the history truncated to `from_index`.
    pub async fn regenerate_from(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        from_index: usize,
        auth_token: &str,
        confirm: Option<&dyn ConfirmHook>,
        on_event: EventSink<'_>,
    ) -> Result<ChatOutcome, ConversationError> {
        let conv = self
            .conversations
            .get(conversation_id)
            .ok_or_else(|| ConversationError::NotFound {
                id: conversation_id.to_string(),
            })?;
        if from_index > conv.messages.len() {
            return Err(ConversationError::InvalidIndex { index: from_index });
        }

        let mut messages = conv.messages[..from_index].to_vec();
        let enabled_tools = self.filter_tools(&conv);
        let result = self
            .agent
            .run(
                cancel,
                &mut messages,
                &enabled_tools,
                auth_token,
                confirm,
                on_event,
            )
            .await;

        self.conversations.update_messages(&conv.id, messages);

        Ok(match result {
            Ok(usage) => ChatOutcome {
                conversation_id: conv.id,
                usage,
                error: None,
            },
            Err(error) => ChatOutcome {
                conversation_id: conv.id,
                usage: Usage::default(),
                error: Some(error),
            },
        })
    }

    /// Edits a message in place, drops the tail and regenerates from there.
    pub async fn edit_message_and_regenerate(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        index: usize,
        content: &str,
        auth_token: &str,
        confirm: Option<&dyn ConfirmHook>,
        on_event: EventSink<'_>,
    ) -> Result<ChatOutcome, ConversationError> {
        self.conversations
            .edit_message(conversation_id, index, content)?;
        self.regenerate_from(
            cancel,
            conversation_id,
            index + 1,
            auth_token,
            confirm,
            on_event,
        )
        .await
    }

    /// Tools active for a conversation. An empty `enabled_sources` list
    /// means every source; `disabled_tools` excludes by full name.
    pub fn filter_tools(&self, conv: &Conversation) -> Vec<Tool> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        if conv.enabled_sources.is_empty() && conv.disabled_tools.is_empty() {
            return tools.clone();
        }

        tools
            .iter()
            .filter(|tool| {
                let name = tool.name();
                if !conv.enabled_sources.is_empty() {
                    let source = tool_source(name);
                    if !conv.enabled_sources.iter().any(|s| s == source) {
                        return false;
                    }
                }
                !conv.disabled_tools.iter().any(|d| d == name)
            })
            .cloned()
            .collect()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_tools(&self, new: Vec<Tool>) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.extend(new);
    }

    /// Drops every tool whose source prefix matches.
    pub fn remove_tools_with_source(&self, source: &str) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.retain(|tool| tool_source(tool.name()) != source);
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }
}

fn derive_title(message: &str) -> String {
    let chars: Vec<char> = message.chars().collect();
    if chars.len() > TITLE_MAX_CHARS {
        let head: String = chars[..TITLE_MAX_CHARS].iter().collect();
        format!("{head}...")
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::gateway::HttpCaller;
    use crate::infrastructure::llm::LlmError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    struct OneLiner;

    #[async_trait]
    impl ChatBackend for OneLiner {
        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _tools: &[Tool],
            _on_delta: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        ) -> Result<(ChatMessage, Option<Usage>), LlmError> {
            Ok((ChatMessage::new(MessageRole::Assistant, "sure"), None))
        }
    }

    fn engine_with_tools(tools: Vec<Tool>) -> Engine<OneLiner> {
        let caller = Arc::new(HttpCaller::new(HashMap::new()).expect("caller"));
        let router = Arc::new(ToolRouter::new(caller, HashMap::new()));
        Engine::new(
            Arc::new(OneLiner),
            router,
            Arc::new(ConversationManager::new(None)),
            tools,
            "system".to_string(),
            0,
        )
    }

    fn tool(name: &str) -> Tool {
        Tool::function(name, "", json!({"type": "object", "properties": {}}))
    }

    #[tokio::test]
    async fn first_turn_creates_titled_conversation() {
        let engine = engine_with_tools(vec![]);
        let sink = |_event: crate::application::agent::AgentEvent| {};
        let outcome = engine
            .chat(&CancellationToken::new(), "", "hello there", "", None, &sink)
            .await;
        assert!(outcome.error.is_none());

        let conv = engine
            .conversations()
            .get(&outcome.conversation_id)
            .expect("created");
        assert_eq!(conv.title, "hello there");
        assert_eq!(conv.messages[0].role, MessageRole::System);
        assert_eq!(conv.messages[1].content, "hello there");
        assert_eq!(conv.messages[2].content, "sure");
    }

    #[tokio::test]
    async fn long_first_messages_are_clipped_into_the_title() {
        let engine = engine_with_tools(vec![]);
        let sink = |_event: crate::application::agent::AgentEvent| {};
        let long = "x".repeat(80);
        let outcome = engine
            .chat(&CancellationToken::new(), "", &long, "", None, &sink)
            .await;
        let conv = engine
            .conversations()
            .get(&outcome.conversation_id)
            .expect("created");
        assert_eq!(conv.title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(conv.title.ends_with("..."));
    }

    #[test]
    fn filtering_by_source_and_name() {
        let engine = engine_with_tools(vec![
            tool("petstore__list"),
            tool("petstore__create"),
            tool("files__read"),
        ]);

        let mut conv = Conversation::new("t");
        conv.enabled_sources = vec!["petstore".into()];
        conv.disabled_tools = vec!["petstore__create".into()];

        let filtered = engine.filter_tools(&conv);
        let names: Vec<&str> = filtered.iter().map(Tool::name).collect();
        assert_eq!(names, vec!["petstore__list"]);
    }

    #[test]
    fn empty_filters_enable_everything() {
        let engine = engine_with_tools(vec![tool("a__x"), tool("b__y")]);
        let conv = Conversation::new("t");
        assert_eq!(engine.filter_tools(&conv).len(), 2);
    }

    #[test]
    fn source_removal_prunes_the_catalog() {
        let engine = engine_with_tools(vec![tool("a__x"), tool("b__y")]);
        engine.remove_tools_with_source("a");
        let names: Vec<String> = engine.tools().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["b__y"]);
    }
}
