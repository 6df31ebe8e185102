use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::conversation::Conversation;
use crate::domain::types::{ChatMessage, MessageRole};

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation not found: {id}")]
    NotFound { id: String },
    #[error("invalid message index {index}")]
    InvalidIndex { index: usize },
}

/// Keeps every conversation in memory behind a reader-writer lock and
/// mirrors each change to `<data_dir>/<id>.json` when a directory is set.
/// File writes happen under the write lock so disk and memory stay in step.
pub struct ConversationManager {
    conversations: RwLock<HashMap<String, Conversation>>,
    data_dir: Option<PathBuf>,
}

impl ConversationManager {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        let manager = Self {
            conversations: RwLock::new(HashMap::new()),
            data_dir,
        };
        manager.load_all();
        manager
    }

    fn load_all(&self) {
        let Some(dir) = &self.data_dir else { return };
        if let Err(err) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), %err, "cannot create conversation directory");
            return;
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cannot read conversation directory");
                return;
            }
        };

        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read(&path) else { continue };
            match serde_json::from_slice::<Conversation>(&raw) {
                Ok(conv) if !conv.id.is_empty() => {
                    conversations.insert(conv.id.clone(), conv);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable conversation file");
                }
            }
        }
        debug!(count = conversations.len(), "conversations loaded from disk");
    }

    pub fn create(&self, title: &str, system_prompt: &str) -> Conversation {
        let mut conv = Conversation::new(title);
        if !system_prompt.is_empty() {
            conv.messages
                .push(ChatMessage::new(MessageRole::System, system_prompt));
        }

        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        conversations.insert(conv.id.clone(), conv.clone());
        self.save_locked(&conv);
        conv
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Most recently updated first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self
            .conversations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    pub fn update_messages(&self, id: &str, messages: Vec<ChatMessage>) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(conv) = conversations.get_mut(id) {
            conv.messages = messages;
            conv.touch();
            let snapshot = conv.clone();
            self.save_locked(&snapshot);
        }
    }

    pub fn update_title(&self, id: &str, title: &str) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(conv) = conversations.get_mut(id) {
            conv.title = title.to_string();
            conv.touch();
            let snapshot = conv.clone();
            self.save_locked(&snapshot);
        }
    }

    pub fn update_tool_config(
        &self,
        id: &str,
        enabled_sources: Vec<String>,
        disabled_tools: Vec<String>,
    ) -> Result<(), ConversationError> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let conv = conversations
            .get_mut(id)
            .ok_or_else(|| ConversationError::NotFound { id: id.to_string() })?;
        conv.enabled_sources = enabled_sources;
        conv.disabled_tools = disabled_tools;
        conv.touch();
        let snapshot = conv.clone();
        self.save_locked(&snapshot);
        Ok(())
    }

    /// Replaces the content of the message at `index` and drops everything
    /// after it, so the turn can be regenerated from the edited point.
    pub fn edit_message(
        &self,
        id: &str,
        index: usize,
        content: &str,
    ) -> Result<(), ConversationError> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let conv = conversations
            .get_mut(id)
            .ok_or_else(|| ConversationError::NotFound { id: id.to_string() })?;
        if index >= conv.messages.len() {
            return Err(ConversationError::InvalidIndex { index });
        }
        conv.messages[index].content = content.to_string();
        conv.messages.truncate(index + 1);
        conv.touch();
        let snapshot = conv.clone();
        self.save_locked(&snapshot);
        Ok(())
    }

    /// Turn-aware single deletion: removing any member of an
    /// (assistant-with-tool-calls, tool replies) block removes the whole
    /// block, so no orphan `tool` message can survive.
    pub fn delete_message(&self, id: &str, index: usize) -> Result<(), ConversationError> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let conv = conversations
            .get_mut(id)
            .ok_or_else(|| ConversationError::NotFound { id: id.to_string() })?;
        if index >= conv.messages.len() {
            return Err(ConversationError::InvalidIndex { index });
        }

        let (start, end) = turn_bounds(&conv.messages, index);
        conv.messages.drain(start..end);
        conv.touch();
        let snapshot = conv.clone();
        self.save_locked(&snapshot);
        Ok(())
    }

    pub fn delete_messages_from(&self, id: &str, index: usize) -> Result<(), ConversationError> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let conv = conversations
            .get_mut(id)
            .ok_or_else(|| ConversationError::NotFound { id: id.to_string() })?;
        if index > conv.messages.len() {
            return Err(ConversationError::InvalidIndex { index });
        }
        // Never leave orphan tool replies at the cut point.
        let cut = if index < conv.messages.len() {
            let (start, _) = turn_bounds(&conv.messages, index);
            start.min(index)
        } else {
            index
        };
        conv.messages.truncate(cut);
        conv.touch();
        let snapshot = conv.clone();
        self.save_locked(&snapshot);
        Ok(())
    }

    pub fn delete(&self, id: &str) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        conversations.remove(id);
        if let Some(dir) = &self.data_dir {
            let path = dir.join(format!("{id}.json"));
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %err, "failed to remove conversation file");
                }
            }
        }
    }

    fn save_locked(&self, conv: &Conversation) {
        let Some(dir) = &self.data_dir else { return };
        let path = dir.join(format!("{}.json", conv.id));
        match serde_json::to_vec(conv) {
            Ok(encoded) => {
                if let Err(err) = fs::write(&path, encoded) {
                    warn!(path = %path.display(), %err, "failed to persist conversation");
                }
            }
            Err(err) => warn!(id = %conv.id, %err, "failed to encode conversation"),
        }
    }
}

/// The `[start, end)` range of the atomic turn containing `index`: a
/// tool-calling assistant message together with its consecutive `tool`
/// replies. Plain messages are their own turn.
fn turn_bounds(messages: &[ChatMessage], index: usize) -> (usize, usize) {
    let mut start = index;
    if messages[index].role == MessageRole::Tool {
        while start > 0 {
            start -= 1;
            match messages[start].role {
                MessageRole::Tool => continue,
                MessageRole::Assistant if messages[start].has_tool_calls() => break,
                _ => {
                    // Orphan tool message; treat it alone.
                    return (index, index + 1);
                }
            }
        }
    }

    if messages[start].role == MessageRole::Assistant && messages[start].has_tool_calls() {
        let mut end = start + 1;
        while end < messages.len() && messages[end].role == MessageRole::Tool {
            end += 1;
        }
        (start, end)
    } else {
        (index, index + 1)
    }
}
