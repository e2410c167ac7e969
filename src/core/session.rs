use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::constants::{
    DEFAULT_MODEL, DEFAULT_TEMPERATURE, DEFAULT_TITLE, MAX_SESSIONS, UNUSED_CREDENTIAL,
};
use crate::core::message::Message;
use crate::core::persistence::{PersistedState, StateError};
use crate::core::title::fallback_title;

/// A persisted conversation: ordered messages, title, associated model,
/// and millisecond Unix timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
    pub model: String,
}

/// Result of a save attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Whether a session record was actually reconciled and persisted.
    pub saved: bool,
    /// Whether AI title synthesis should be scheduled: the session has not
    /// been titled yet, holds at least two messages, and a real credential
    /// is available.
    pub needs_title: bool,
}

impl SaveOutcome {
    fn noop() -> Self {
        SaveOutcome {
            saved: false,
            needs_title: false,
        }
    }
}

/// State machine owning the session collection and the active buffer.
///
/// All mutations of the collection and buffer go through these operations;
/// the store is the single writer. The active buffer is ephemeral view state
/// reconciled into the matching session record on save, never persisted on
/// its own.
pub struct SessionStore {
    sessions: Vec<ChatSession>,
    current_session_id: Option<String>,
    messages: Vec<Message>,
    selected_model: String,
    credential: String,
    temperature: f64,
    system_prompt: String,
    available_models: Vec<String>,
    hydrated: bool,
    state_path: Option<PathBuf>,
}

impl SessionStore {
    /// Create an empty store. Persistence is disabled when `state_path` is
    /// `None`, which test instances use for isolation.
    pub fn new(state_path: Option<PathBuf>) -> Self {
        SessionStore {
            sessions: Vec::new(),
            current_session_id: None,
            messages: Vec::new(),
            selected_model: DEFAULT_MODEL.to_string(),
            credential: UNUSED_CREDENTIAL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: String::new(),
            available_models: Vec::new(),
            hydrated: false,
            state_path,
        }
    }

    /// Rehydrate persisted state from disk. Runs once at startup; a missing
    /// file yields defaults and a corrupt one is logged and ignored. Sets
    /// the `hydrated` flag either way so the UI knows rendering is safe.
    pub fn hydrate(&mut self) {
        if let Some(path) = self.state_path.clone() {
            match PersistedState::load_from_path(&path) {
                Ok(state) => self.apply_persisted(state),
                Err(err) => warn!(error = %err, "failed to load persisted state"),
            }
        }
        self.hydrated = true;
    }

    fn apply_persisted(&mut self, state: PersistedState) {
        self.selected_model = state.selected_model;
        self.credential = state.credential;
        self.temperature = state.temperature;
        self.system_prompt = state.system_prompt;
        self.sessions = state.chat_sessions;
        self.current_session_id = state
            .current_session_id
            .filter(|id| self.sessions.iter().any(|s| s.id == *id));
    }

    pub fn hydrated(&self) -> bool {
        self.hydrated
    }

    /// Snapshot of the persisted subset of store state.
    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            selected_model: self.selected_model.clone(),
            credential: self.credential.clone(),
            temperature: self.temperature,
            system_prompt: self.system_prompt.clone(),
            chat_sessions: self.sessions.clone(),
            current_session_id: self.current_session_id.clone(),
        }
    }

    pub fn try_persist(&self) -> Result<(), StateError> {
        match &self.state_path {
            Some(path) => self.snapshot().save_to_path(path),
            None => Ok(()),
        }
    }

    // A failed write must not take down the UI; the in-memory state stays
    // authoritative until the next successful save.
    fn persist(&self) {
        if let Err(err) = self.try_persist() {
            warn!(error = %err, "failed to persist state");
        }
    }

    /// Create a fresh session, make it current, and clear the active
    /// buffer. Returns the new session id.
    pub fn create_session(&mut self) -> String {
        let id = new_session_id();
        let now = now_millis();
        self.sessions.insert(
            0,
            ChatSession {
                id: id.clone(),
                title: DEFAULT_TITLE.to_string(),
                messages: Vec::new(),
                created_at: now,
                updated_at: now,
                model: self.selected_model.clone(),
            },
        );
        self.current_session_id = Some(id.clone());
        self.messages.clear();
        self.evict_excess();
        self.persist();
        debug!(session_id = %id, "created session");
        id
    }

    /// Reconcile the active buffer into the current session record.
    ///
    /// No-op when there is no current session, the buffer is empty, or
    /// nothing changed since the last reconciliation (so `updated_at`
    /// advances at most once per actual change). The heuristic title is
    /// applied only while the session still carries the default placeholder.
    pub fn save_current_session(&mut self) -> SaveOutcome {
        let Some(current_id) = self.current_session_id.clone() else {
            return SaveOutcome::noop();
        };
        if self.messages.is_empty() {
            return SaveOutcome::noop();
        }

        let has_credential = self.has_real_credential();
        let selected_model = self.selected_model.clone();
        let message_count = self.messages.len();
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == current_id) else {
            return SaveOutcome::noop();
        };

        let was_default_title = session.title == DEFAULT_TITLE;
        let needs_title = was_default_title && message_count >= 2 && has_credential;

        if session.messages == self.messages && session.model == selected_model {
            return SaveOutcome {
                saved: false,
                needs_title,
            };
        }

        session.messages = self.messages.clone();
        session.updated_at = now_millis();
        session.model = selected_model;
        if was_default_title {
            session.title = fallback_title(&self.messages);
        }
        self.persist();

        SaveOutcome {
            saved: true,
            needs_title,
        }
    }

    /// Make `id` the current session and replace the active buffer with a
    /// copy of its messages and model. Unknown ids are a silent no-op.
    pub fn load_session(&mut self, id: &str) {
        let Some(session) = self.sessions.iter().find(|s| s.id == id) else {
            return;
        };
        self.messages = session.messages.clone();
        self.selected_model = session.model.clone();
        self.current_session_id = Some(id.to_string());
        self.persist();
    }

    /// Remove a session. Deleting the current session clears the current
    /// pointer and the active buffer.
    pub fn delete_session(&mut self, id: &str) {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != id);
        if self.sessions.len() == before {
            return;
        }
        if self.current_session_id.as_deref() == Some(id) {
            self.current_session_id = None;
            self.messages.clear();
        }
        self.persist();
    }

    /// Enforce the collection bound: keep the `MAX_SESSIONS` sessions with
    /// the largest `updated_at`, discard the rest unconditionally.
    pub fn evict_excess(&mut self) {
        if self.sessions.len() <= MAX_SESSIONS {
            return;
        }
        self.sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.sessions.truncate(MAX_SESSIONS);
        if let Some(id) = self.current_session_id.clone() {
            if !self.sessions.iter().any(|s| s.id == id) {
                self.current_session_id = None;
                self.messages.clear();
            }
        }
    }

    /// Overwrite a session title by id, refreshing `updated_at`. A no-op
    /// when the session was deleted in the meantime.
    pub fn set_session_title(&mut self, id: &str, title: String) {
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) else {
            return;
        };
        session.title = title;
        session.updated_at = now_millis();
        self.persist();
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn session(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    // --- Active buffer ---

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn append_user_message(&mut self, content: &str) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant_placeholder(&mut self) {
        self.messages.push(Message::assistant(""));
    }

    /// Append streamed text to the trailing assistant message in place.
    ///
    /// This is the single documented exception to message immutability;
    /// no other in-place list mutation is permitted. Returns false when the
    /// buffer does not end with an assistant message.
    pub fn append_to_last_assistant(&mut self, delta: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) if last.is_assistant() => {
                last.content.push_str(delta);
                true
            }
            _ => false,
        }
    }

    /// Roll back a failed turn: discard the trailing assistant message,
    /// leaving the user message in place.
    pub fn drop_trailing_assistant(&mut self) -> bool {
        if self.messages.last().is_some_and(Message::is_assistant) {
            self.messages.pop();
            true
        } else {
            false
        }
    }

    // --- Settings ---

    pub fn selected_model(&self) -> &str {
        &self.selected_model
    }

    pub fn set_selected_model(&mut self, model: String) {
        self.selected_model = model;
        self.persist();
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn has_real_credential(&self) -> bool {
        !self.credential.trim().is_empty() && self.credential != UNUSED_CREDENTIAL
    }

    pub fn set_credential(&mut self, credential: String) {
        self.credential = if credential.trim().is_empty() {
            UNUSED_CREDENTIAL.to_string()
        } else {
            credential
        };
        self.persist();
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
        self.persist();
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = prompt;
        self.persist();
    }

    pub fn available_models(&self) -> &[String] {
        &self.available_models
    }

    /// Replace the model list. Callers only invoke this on a successful
    /// refresh; a failed listing leaves the previous list intact.
    pub fn set_available_models(&mut self, models: Vec<String>) {
        self.available_models = models;
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Time-based id with a random suffix; collision probability negligible.
fn new_session_id() -> String {
    format!("session-{}-{}", now_millis(), random_suffix())
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 4];
    if getrandom::fill(&mut bytes).is_err() {
        bytes = Utc::now().timestamp_subsec_nanos().to_le_bytes();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> SessionStore {
        SessionStore::new(None)
    }

    fn stub_session(id: &str, updated_at: i64) -> ChatSession {
        ChatSession {
            id: id.to_string(),
            title: format!("Session {id}"),
            messages: vec![Message::user("hello")],
            created_at: updated_at - 10,
            updated_at,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    #[test]
    fn create_session_inserts_at_front_and_sets_current() {
        let mut store = store();
        let first = store.create_session();
        let second = store.create_session();

        assert_ne!(first, second);
        assert_eq!(store.sessions().len(), 2);
        assert_eq!(store.sessions()[0].id, second);
        assert_eq!(store.sessions()[0].title, DEFAULT_TITLE);
        assert_eq!(store.current_session_id(), Some(second.as_str()));
        assert!(store.messages().is_empty());
    }

    #[test]
    fn create_session_clears_the_active_buffer() {
        let mut store = store();
        store.create_session();
        store.append_user_message("leftover");
        store.create_session();
        assert!(store.messages().is_empty());
    }

    #[test]
    fn session_ids_are_unique() {
        let mut store = store();
        let mut ids: Vec<String> = (0..20).map(|_| store.create_session()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn save_reconciles_buffer_into_session_record() {
        let mut store = store();
        let id = store.create_session();
        store.append_user_message("Explain TCP handshakes");
        store.push_assistant_placeholder();
        store.append_to_last_assistant("TCP uses a three-way...");

        let outcome = store.save_current_session();
        assert!(outcome.saved);

        let session = store.session(&id).expect("session exists");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.title, "Explain TCP handshakes");
        assert_eq!(session.model, DEFAULT_MODEL);
        assert!(session.updated_at >= session.created_at);
    }

    #[test]
    fn save_without_current_session_or_messages_is_a_noop() {
        let mut store = store();
        assert_eq!(store.save_current_session(), SaveOutcome::noop());

        store.create_session();
        assert_eq!(store.save_current_session(), SaveOutcome::noop());
    }

    #[test]
    fn repeated_save_without_changes_does_not_advance_updated_at() {
        let mut store = store();
        let id = store.create_session();
        store.append_user_message("hi");
        assert!(store.save_current_session().saved);
        let first_updated_at = store.session(&id).unwrap().updated_at;

        let outcome = store.save_current_session();
        assert!(!outcome.saved);
        assert_eq!(store.session(&id).unwrap().updated_at, first_updated_at);
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn save_preserves_non_default_titles() {
        let mut store = store();
        let id = store.create_session();
        store.append_user_message("hi");
        store.save_current_session();
        store.set_session_title(&id, "Handpicked".to_string());

        store.append_user_message("more");
        store.save_current_session();
        assert_eq!(store.session(&id).unwrap().title, "Handpicked");
    }

    #[test]
    fn needs_title_with_two_messages_and_a_real_credential() {
        let mut store = store();
        store.set_credential("tok-123".to_string());
        store.create_session();
        store.append_user_message("hi");
        store.push_assistant_placeholder();
        store.append_to_last_assistant("hello");
        assert!(store.save_current_session().needs_title);
    }

    #[test]
    fn needs_title_is_false_for_a_single_message() {
        let mut store = store();
        store.set_credential("tok-123".to_string());
        store.create_session();
        store.append_user_message("hi");
        assert!(!store.save_current_session().needs_title);
    }

    #[test]
    fn needs_title_is_false_with_sentinel_credential() {
        let mut store = store();
        store.create_session();
        store.append_user_message("hi");
        store.push_assistant_placeholder();
        store.append_to_last_assistant("hello");
        assert!(!store.save_current_session().needs_title);
    }

    #[test]
    fn load_session_replaces_buffer_and_model() {
        let mut store = store();
        let first = store.create_session();
        store.append_user_message("first conversation");
        store.save_current_session();

        let second = store.create_session();
        store.append_user_message("second conversation");
        store.save_current_session();
        assert_eq!(store.current_session_id(), Some(second.as_str()));

        store.load_session(&first);
        assert_eq!(store.current_session_id(), Some(first.as_str()));
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.messages()[0].content, "first conversation");
    }

    #[test]
    fn load_unknown_session_is_a_noop() {
        let mut store = store();
        let id = store.create_session();
        store.append_user_message("kept");

        store.load_session("session-0-missing");
        assert_eq!(store.current_session_id(), Some(id.as_str()));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn deleting_current_session_clears_pointer_and_buffer() {
        let mut store = store();
        let id = store.create_session();
        store.append_user_message("hello");

        store.delete_session(&id);
        assert!(store.current_session_id().is_none());
        assert!(store.messages().is_empty());
        assert!(store.sessions().is_empty());
    }

    #[test]
    fn deleting_other_session_keeps_current_buffer() {
        let mut store = store();
        let other = store.create_session();
        let current = store.create_session();
        store.append_user_message("active");

        store.delete_session(&other);
        assert_eq!(store.current_session_id(), Some(current.as_str()));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn eviction_keeps_the_most_recently_updated_sessions() {
        let mut store = store();
        for i in 0..(MAX_SESSIONS + 10) {
            store.sessions.push(stub_session(&format!("s{i}"), i as i64));
        }

        store.evict_excess();
        assert_eq!(store.sessions().len(), MAX_SESSIONS);

        let kept_min = store
            .sessions()
            .iter()
            .map(|s| s.updated_at)
            .min()
            .unwrap();
        assert_eq!(kept_min, 10);
    }

    #[test]
    fn eviction_clears_current_pointer_when_current_is_evicted() {
        let mut store = store();
        for i in 0..(MAX_SESSIONS + 1) {
            store
                .sessions
                .push(stub_session(&format!("s{i}"), 100 + i as i64));
        }
        store.current_session_id = Some("s0".to_string());
        store.messages.push(Message::user("stale"));

        store.evict_excess();
        assert!(store.current_session_id().is_none());
        assert!(store.messages().is_empty());
    }

    #[test]
    fn set_session_title_on_deleted_session_is_a_noop() {
        let mut store = store();
        let id = store.create_session();
        store.delete_session(&id);
        store.set_session_title(&id, "Too late".to_string());
        assert!(store.sessions().is_empty());
    }

    #[test]
    fn append_to_last_assistant_requires_trailing_assistant() {
        let mut store = store();
        store.create_session();
        store.append_user_message("hi");
        assert!(!store.append_to_last_assistant("nope"));

        store.push_assistant_placeholder();
        assert!(store.append_to_last_assistant("TCP "));
        assert!(store.append_to_last_assistant("uses a three-way..."));
        assert_eq!(store.messages()[1].content, "TCP uses a three-way...");
    }

    #[test]
    fn drop_trailing_assistant_keeps_the_user_message() {
        let mut store = store();
        store.create_session();
        store.append_user_message("hi");
        store.push_assistant_placeholder();

        assert!(store.drop_trailing_assistant());
        assert_eq!(store.messages().len(), 1);
        assert!(store.messages()[0].is_user());
        assert!(!store.drop_trailing_assistant());
    }

    #[test]
    fn persisted_state_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let mut store = SessionStore::new(Some(path.clone()));
        store.set_credential("tok-xyz".to_string());
        store.set_system_prompt("Be concise.".to_string());
        let id = store.create_session();
        store.append_user_message("Explain TCP handshakes");
        store.push_assistant_placeholder();
        store.append_to_last_assistant("TCP uses a three-way...");
        store.save_current_session();

        let mut rehydrated = SessionStore::new(Some(path));
        assert!(!rehydrated.hydrated());
        rehydrated.hydrate();
        assert!(rehydrated.hydrated());

        assert_eq!(rehydrated.sessions(), store.sessions());
        assert_eq!(rehydrated.current_session_id(), Some(id.as_str()));
        assert_eq!(rehydrated.credential(), "tok-xyz");
        assert_eq!(rehydrated.system_prompt(), "Be concise.");
        assert_eq!(rehydrated.selected_model(), store.selected_model());
        // The active buffer itself is never persisted directly.
        assert!(rehydrated.messages().is_empty());
    }

    #[test]
    fn hydrate_drops_dangling_current_session_id() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let state = PersistedState {
            current_session_id: Some("session-gone".to_string()),
            ..PersistedState::default()
        };
        state.save_to_path(&path).expect("save");

        let mut store = SessionStore::new(Some(path));
        store.hydrate();
        assert!(store.current_session_id().is_none());
    }
}
