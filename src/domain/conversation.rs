use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::ChatMessage;

/// A persisted chat thread: ordered messages plus per-conversation tool policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tool sources enabled for this conversation; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_sources: Vec<String>,
    /// Fully-qualified tool names excluded regardless of source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_tools: Vec<String>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_conversation_id(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            enabled_sources: Vec::new(),
            disabled_tools: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 128-bit random id rendered as 32 lowercase hex characters.
pub fn new_conversation_id() -> String {
    Uuid::new_v4().simple().to_string()
}
