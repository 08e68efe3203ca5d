//! Conversation persistence: a capped, ordered list of conversations kept in
//! memory and mirrored to a JSON file (written atomically via tmp + rename).
//!
//! Newest conversations sit at the front of the list; when the cap is
//! exceeded the oldest entries fall off the end. Inline binary payloads are
//! stripped before serialization, so a reload never carries attachment bytes.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::SessionError;
use super::types::{Conversation, Message, Part};

/// Maximum number of persisted conversations; oldest are evicted first.
pub const MAX_SESSIONS: usize = 150;

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    version: u32,
    #[serde(rename = "activeId", default)]
    active_id: Option<String>,
    #[serde(default)]
    sessions: Vec<Conversation>,
}

struct SessionStoreInner {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
    io_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

fn new_id() -> String {
    format!("chat_{}", Uuid::new_v4())
}

fn strip_inline_data(sessions: &mut [Conversation]) {
    for session in sessions {
        for message in &mut session.messages {
            for part in &mut message.parts {
                if let Part::File { inline_data, .. } = part {
                    *inline_data = None;
                }
            }
        }
    }
}

fn enforce_session_limit(sessions: &mut Vec<Conversation>) {
    if sessions.len() > MAX_SESSIONS {
        sessions.truncate(MAX_SESSIONS);
        log::info!("Session list capped at {}, oldest dropped", MAX_SESSIONS);
    }
}

impl SessionStore {
    /// Open a store backed by `path`, loading any existing state.
    pub fn open(path: PathBuf) -> Self {
        let state = Self::load_state(&path);
        Self {
            inner: Arc::new(SessionStoreInner {
                path: Some(path),
                state: Mutex::new(state),
                io_lock: Mutex::new(()),
            }),
        }
    }

    /// Open a store in the user data directory.
    pub fn open_default() -> Result<Self, SessionError> {
        let dir = dirs::data_dir()
            .ok_or_else(|| SessionError::storage("No user data directory available"))?;
        Ok(Self::open(dir.join("streamchat").join("sessions.json")))
    }

    /// In-memory store, never written to disk. Used by tests and embedders
    /// that persist elsewhere.
    pub fn ephemeral() -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                path: None,
                state: Mutex::new(StoreState::default()),
                io_lock: Mutex::new(()),
            }),
        }
    }

    fn load_state(path: &PathBuf) -> StoreState {
        let Ok(contents) = fs::read_to_string(path) else {
            return StoreState::default();
        };
        match serde_json::from_str::<StoreState>(&contents) {
            Ok(mut state) => {
                enforce_session_limit(&mut state.sessions);
                state
            }
            Err(err) => {
                log::error!("Failed to load sessions from {}: {}", path.display(), err);
                StoreState::default()
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist the current state. Failures are logged, never propagated;
    /// the in-memory list stays authoritative for the session.
    pub fn save(&self) {
        let snapshot = {
            let mut state = self.lock_state();
            enforce_session_limit(&mut state.sessions);
            let mut snapshot = state.clone();
            strip_inline_data(&mut snapshot.sessions);
            snapshot.version = STORE_VERSION;
            snapshot
        };

        let Some(path) = self.inner.path.as_ref() else {
            return;
        };
        let serialized = match serde_json::to_string(&snapshot) {
            Ok(s) => s,
            Err(err) => {
                log::error!("Failed to serialize sessions: {}", err);
                return;
            }
        };

        let _guard = self
            .inner
            .io_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp_path = path.with_extension("json.tmp");
        match fs::write(&tmp_path, serialized) {
            Ok(()) => {
                if let Err(err) = fs::rename(&tmp_path, path) {
                    log::error!("Failed to persist sessions to {}: {}", path.display(), err);
                }
            }
            Err(err) => {
                log::error!("Failed to write {}: {}", tmp_path.display(), err);
            }
        }
    }

    /// Create a conversation at the front of the list and make it active.
    pub fn create_conversation(&self, title: Option<String>, model: String) -> Conversation {
        let conversation = Conversation {
            id: new_id(),
            title: title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "New chat".to_string()),
            model,
            messages: Vec::new(),
        };

        {
            let mut state = self.lock_state();
            state.sessions.insert(0, conversation.clone());
            state.active_id = Some(conversation.id.clone());
            enforce_session_limit(&mut state.sessions);
        }
        self.save();
        conversation
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock_state().sessions.clone()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.lock_state()
            .sessions
            .iter()
            .find(|s| s.id == conversation_id)
            .cloned()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        let state = self.lock_state();
        let id = state.active_id.as_deref()?;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn set_active(&self, conversation_id: &str) -> Result<(), SessionError> {
        let mut state = self.lock_state();
        if !state.sessions.iter().any(|s| s.id == conversation_id) {
            return Err(SessionError::not_found("Conversation not found"));
        }
        state.active_id = Some(conversation_id.to_string());
        drop(state);
        self.save();
        Ok(())
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), SessionError> {
        {
            let mut state = self.lock_state();
            let before = state.sessions.len();
            state.sessions.retain(|s| s.id != conversation_id);
            if state.sessions.len() == before {
                return Err(SessionError::not_found("Conversation not found"));
            }
            if state.active_id.as_deref() == Some(conversation_id) {
                state.active_id = state.sessions.first().map(|s| s.id.clone());
            }
        }
        self.save();
        Ok(())
    }

    pub fn rename_conversation(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), SessionError> {
        let title = title.lines().next().unwrap_or(title).trim();
        if title.is_empty() {
            return Err(SessionError::invalid_input("Title is empty"));
        }
        self.with_conversation(conversation_id, |conversation| {
            conversation.title = title.to_string();
            Ok(())
        })?;
        self.save();
        Ok(())
    }

    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, SessionError> {
        let state = self.lock_state();
        state
            .sessions
            .iter()
            .find(|s| s.id == conversation_id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| SessionError::not_found("Conversation not found"))
    }

    pub fn message(&self, conversation_id: &str, index: usize) -> Option<Message> {
        let state = self.lock_state();
        state
            .sessions
            .iter()
            .find(|s| s.id == conversation_id)
            .and_then(|s| s.messages.get(index))
            .cloned()
    }

    fn with_conversation<T>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut Conversation) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut state = self.lock_state();
        let conversation = state
            .sessions
            .iter_mut()
            .find(|s| s.id == conversation_id)
            .ok_or_else(|| SessionError::not_found("Conversation not found"))?;
        f(conversation)
    }

    /// Append a message, returning its index.
    pub fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<usize, SessionError> {
        let index = self.with_conversation(conversation_id, |conversation| {
            conversation.messages.push(message);
            Ok(conversation.messages.len() - 1)
        })?;
        self.save();
        Ok(index)
    }

    /// Replace the message at `index` and persist. This is the
    /// placeholder-commit operation: swap and save run synchronously with no
    /// intervening await, so no turn can observe a half-updated list.
    pub fn commit_message(
        &self,
        conversation_id: &str,
        index: usize,
        message: Message,
    ) -> Result<(), SessionError> {
        self.with_conversation(conversation_id, |conversation| {
            let slot = conversation
                .messages
                .get_mut(index)
                .ok_or_else(|| SessionError::not_found("Message index out of range"))?;
            *slot = message;
            Ok(())
        })?;
        self.save();
        Ok(())
    }

    pub fn remove_message(&self, conversation_id: &str, index: usize) -> Result<(), SessionError> {
        self.with_conversation(conversation_id, |conversation| {
            if index >= conversation.messages.len() {
                return Err(SessionError::not_found("Message index out of range"));
            }
            conversation.messages.remove(index);
            Ok(())
        })?;
        self.save();
        Ok(())
    }

    /// Drop every message from `len` onward (regenerate / edit-and-resend).
    pub fn truncate_messages(
        &self,
        conversation_id: &str,
        len: usize,
    ) -> Result<(), SessionError> {
        self.with_conversation(conversation_id, |conversation| {
            conversation.messages.truncate(len);
            Ok(())
        })?;
        self.save();
        Ok(())
    }

    /// Record the generation context on the user message that triggered an
    /// image generation, for later prompt reconstruction.
    pub fn annotate_user_prompt(
        &self,
        conversation_id: &str,
        index: usize,
        english_prompt: &str,
        aspect_ratio: Option<&str>,
    ) -> Result<(), SessionError> {
        self.with_conversation(conversation_id, |conversation| {
            let message = conversation
                .messages
                .get_mut(index)
                .ok_or_else(|| SessionError::not_found("Message index out of range"))?;
            if message.role != super::types::Role::User {
                return Err(SessionError::invalid_input(
                    "Prompt annotation targets a user message",
                ));
            }
            message.english_prompt_used = Some(english_prompt.to_string());
            message.aspect_ratio_used = aspect_ratio.map(str::to_string);
            Ok(())
        })?;
        self.save();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{InlineData, Role};

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::open(dir.path().join("sessions.json"))
    }

    #[test]
    fn test_roundtrip_and_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let conversation = store.create_conversation(Some("Trip plan".into()), "gemini".into());
        store
            .append_message(&conversation.id, Message::user(vec![Part::text("hi")]))
            .unwrap();

        let reopened = store_in(&dir);
        let active = reopened.active_conversation().expect("active restored");
        assert_eq!(active.id, conversation.id);
        assert_eq!(active.title, "Trip plan");
        assert_eq!(active.messages.len(), 1);
    }

    #[test]
    fn test_inline_data_stripped_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let conversation = store.create_conversation(None, "gemini".into());
        store
            .append_message(
                &conversation.id,
                Message::user(vec![Part::File {
                    file_url: "https://x/f".into(),
                    mime_type: "application/pdf".into(),
                    name: "f.pdf".into(),
                    inline_data: Some(InlineData {
                        mime_type: "application/pdf".into(),
                        data: "QUJD".into(),
                    }),
                }]),
            )
            .unwrap();

        // The live list keeps the payload for the current turn.
        let live = store.message(&conversation.id, 0).unwrap();
        assert!(matches!(
            &live.parts[0],
            Part::File { inline_data: Some(_), .. }
        ));

        // The reloaded list does not.
        let reopened = store_in(&dir);
        let persisted = reopened.message(&conversation.id, 0).unwrap();
        assert!(matches!(
            &persisted.parts[0],
            Part::File { inline_data: None, .. }
        ));
    }

    #[test]
    fn test_session_cap_evicts_oldest() {
        let store = SessionStore::ephemeral();
        let first = store.create_conversation(Some("oldest".into()), "m".into());
        for i in 0..MAX_SESSIONS {
            store.create_conversation(Some(format!("chat {}", i)), "m".into());
        }
        let sessions = store.conversations();
        assert_eq!(sessions.len(), MAX_SESSIONS);
        assert!(sessions.iter().all(|s| s.id != first.id));
    }

    #[test]
    fn test_commit_replaces_placeholder_in_place() {
        let store = SessionStore::ephemeral();
        let conversation = store.create_conversation(None, "m".into());
        store
            .append_message(&conversation.id, Message::user(vec![Part::text("hi")]))
            .unwrap();
        let index = store
            .append_message(&conversation.id, Message::placeholder())
            .unwrap();

        store
            .commit_message(
                &conversation.id,
                index,
                Message::model(vec![Part::text("Hello world")]),
            )
            .unwrap();

        let messages = store.messages(&conversation.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[index].role, Role::Model);
        assert!(messages[index].is_final());
        assert_eq!(messages[index].parts[0].as_text(), Some("Hello world"));
    }

    #[test]
    fn test_remove_message_drops_empty_turn() {
        let store = SessionStore::ephemeral();
        let conversation = store.create_conversation(None, "m".into());
        store
            .append_message(&conversation.id, Message::user(vec![Part::text("hi")]))
            .unwrap();
        let index = store
            .append_message(&conversation.id, Message::placeholder())
            .unwrap();

        store.remove_message(&conversation.id, index).unwrap();
        assert_eq!(store.messages(&conversation.id).unwrap().len(), 1);
    }

    #[test]
    fn test_annotate_user_prompt() {
        let store = SessionStore::ephemeral();
        let conversation = store.create_conversation(None, "m".into());
        let index = store
            .append_message(&conversation.id, Message::user(vec![Part::text("a cat")]))
            .unwrap();

        store
            .annotate_user_prompt(&conversation.id, index, "a cat", Some("9:16"))
            .unwrap();
        let message = store.message(&conversation.id, index).unwrap();
        assert_eq!(message.english_prompt_used.as_deref(), Some("a cat"));
        assert_eq!(message.aspect_ratio_used.as_deref(), Some("9:16"));

        let model_index = store
            .append_message(&conversation.id, Message::placeholder())
            .unwrap();
        assert!(
            store
                .annotate_user_prompt(&conversation.id, model_index, "x", None)
                .is_err()
        );
    }
}
