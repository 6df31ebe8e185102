use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::engine::Engine;
use crate::config::{ConfigStore, DataPaths};
use crate::infrastructure::gateway::HttpCaller;

/// One in-flight chat stream: cancellable, with a single-slot channel for
/// the pending confirmation answer.
pub struct ChatSession {
    pub cancel: CancellationToken,
    pub confirm_tx: mpsc::Sender<bool>,
}

pub struct AppState<B> {
    pub engine: Engine<B>,
    pub caller: Arc<HttpCaller>,
    pub store: Arc<ConfigStore>,
    pub paths: DataPaths,
    pub language: String,
    pub sessions: Mutex<HashMap<String, ChatSession>>,
}

impl<B> AppState<B> {
    pub fn new(
        engine: Engine<B>,
        caller: Arc<HttpCaller>,
        store: Arc<ConfigStore>,
        paths: DataPaths,
        language: String,
    ) -> Self {
        Self {
            engine,
            caller,
            store,
            paths,
            language,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_session(&self, id: &str, session: ChatSession) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), session);
    }

    pub fn drop_session(&self, id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn cancel_session(&self, id: &str) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn answer_confirmation(&self, id: &str, approved: bool) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(id) {
            Some(session) => session.confirm_tx.try_send(approved).is_ok(),
            None => false,
        }
    }
}
