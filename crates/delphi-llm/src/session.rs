//! Per-fid conversation sessions.
//!
//! Each fid that touches a session-aware file gets its own [`Session`]
//! with isolated history, so one client's prompts never leak into
//! another's context. The [`SessionManager`] owns the fid → session table
//! and dispatches through the backend's history-isolated ask.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::{Backend, LlmResult, Message, Role};

/// Conversation state owned by a single fid.
pub struct Session {
    fid: u32,
    inner: RwLock<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    messages: Vec<Message>,
    last_response: String,
    last_tokens: u64,
    total_tokens: u64,
}

impl Session {
    fn new(fid: u32) -> Self {
        Self {
            fid,
            inner: RwLock::new(SessionInner::default()),
        }
    }

    /// The fid that owns this session.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Snapshot of the session's conversation history.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    /// History as pretty-printed JSON.
    pub fn messages_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.inner.read().messages)
    }

    /// Append a message to the history.
    pub fn add_message(&self, role: Role, content: &str) {
        self.inner.write().messages.push(Message {
            role,
            content: content.to_string(),
        });
    }

    /// Prepend a system message so it precedes the dialogue.
    pub fn add_system_message(&self, content: &str) {
        self.inner.write().messages.insert(0, Message::system(content));
    }

    /// Last response (or error text) for this session.
    pub fn last_response(&self) -> String {
        self.inner.read().last_response.clone()
    }

    /// Store the text subsequent reads of `ask` will return.
    pub fn set_last_response(&self, response: &str) {
        self.inner.write().last_response = response.to_string();
    }

    /// Token count of the session's last request.
    pub fn last_tokens(&self) -> u64 {
        self.inner.read().last_tokens
    }

    /// Cumulative token count since the session's last reset.
    pub fn total_tokens(&self) -> u64 {
        self.inner.read().total_tokens
    }

    /// Record one request's usage.
    pub fn add_tokens(&self, tokens: u64) {
        let mut inner = self.inner.write();
        inner.last_tokens = tokens;
        inner.total_tokens += tokens;
    }

    /// Clear history, response, and counters.
    pub fn reset(&self) {
        *self.inner.write() = SessionInner::default();
    }

    /// True when the session has no history.
    pub fn is_empty(&self) -> bool {
        self.inner.read().messages.is_empty()
    }
}

/// Fid → session table plus the shared backend.
///
/// Entries are created on demand and removed on clunk or connection
/// teardown; they never survive across connections.
pub struct SessionManager {
    sessions: DashMap<u32, Arc<Session>>,
    backend: Arc<dyn Backend>,
}

impl SessionManager {
    /// New manager over the given shared backend.
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            backend,
        })
    }

    /// The shared backend (global settings, streaming, compaction).
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Existing session for `fid`, or a fresh empty one.
    pub fn get_or_create(&self, fid: u32) -> Arc<Session> {
        self.sessions
            .entry(fid)
            .or_insert_with(|| Arc::new(Session::new(fid)))
            .value()
            .clone()
    }

    /// Lookup without creation.
    pub fn get(&self, fid: u32) -> Option<Arc<Session>> {
        self.sessions.get(&fid).map(|s| s.value().clone())
    }

    /// Clear the session's state, keeping the mapping live.
    pub fn reset(&self, fid: u32) {
        self.get_or_create(fid).reset();
    }

    /// Drop the fid's session entirely.
    pub fn remove(&self, fid: u32) {
        self.sessions.remove(&fid);
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Send a prompt using the session's own history.
    ///
    /// The session's history is snapshotted before dispatch and grows by
    /// exactly the `user` and `assistant` turns on success. On failure the
    /// history is unchanged and the error text becomes the session's last
    /// response so shell clients can read it back.
    pub async fn ask(&self, fid: u32, prompt: &str) -> LlmResult<String> {
        let session = self.get_or_create(fid);

        // Snapshot under the session lock, release, then dispatch.
        let history = session.messages();

        match self.backend.ask_with_history(&history, prompt).await {
            Ok((response, tokens)) => {
                session.add_message(Role::User, prompt);
                session.add_message(Role::Assistant, &response);
                session.add_tokens(tokens);
                session.set_last_response(&response);
                Ok(response)
            }
            Err(e) => {
                session.set_last_response(&format!("Error: {e}"));
                Err(e)
            }
        }
    }

    /// Context window limit of the shared backend's current model.
    pub async fn context_limit(&self) -> u64 {
        self.backend.context_limit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    fn manager() -> (Arc<MockBackend>, Arc<SessionManager>) {
        let backend = MockBackend::shared();
        let manager = SessionManager::new(backend.clone());
        (backend, manager)
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let (_, sm) = manager();
        let a = sm.get_or_create(1);
        let b = sm.get_or_create(1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn test_remove() {
        let (_, sm) = manager();
        sm.get_or_create(1);
        sm.remove(1);
        assert!(sm.get(1).is_none());
    }

    #[tokio::test]
    async fn test_ask_appends_user_then_assistant() {
        let (backend, sm) = manager();
        backend.set_ask_response("four");

        let response = sm.ask(7, "2+2?").await.unwrap();
        assert_eq!(response, "four");

        let session = sm.get(7).unwrap();
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "2+2?");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "four");
        assert_eq!(session.last_response(), "four");
        assert!(session.total_tokens() > 0);
    }

    #[tokio::test]
    async fn test_ask_error_leaves_history_unchanged() {
        let (backend, sm) = manager();
        backend.set_ask_response("ok");
        sm.ask(3, "first").await.unwrap();

        backend.set_ask_error("backend down");
        let err = sm.ask(3, "second").await.unwrap_err();
        assert!(err.to_string().contains("backend down"));

        let session = sm.get(3).unwrap();
        assert_eq!(session.messages().len(), 2);
        assert!(session.last_response().starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (backend, sm) = manager();

        backend.set_ask_response("ra");
        sm.ask(3, "A").await.unwrap();

        backend.set_ask_response("rb");
        sm.ask(4, "B").await.unwrap();

        assert_eq!(sm.get(3).unwrap().last_response(), "ra");
        assert_eq!(sm.get(4).unwrap().last_response(), "rb");
        assert_eq!(sm.get(3).unwrap().messages()[0].content, "A");
        assert_eq!(sm.get(4).unwrap().messages()[0].content, "B");
    }

    #[tokio::test]
    async fn test_history_reaches_backend() {
        let (backend, sm) = manager();
        backend.set_ask_response("r1");
        sm.ask(1, "first").await.unwrap();

        backend.set_ask_response("r2");
        sm.ask(1, "second").await.unwrap();

        // The second call must have seen the first exchange as history.
        let history = backend.last_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[1].content, "r1");
    }

    #[test]
    fn test_reset_keeps_mapping() {
        let (_, sm) = manager();
        let session = sm.get_or_create(5);
        session.add_message(Role::User, "x");
        session.add_tokens(10);

        sm.reset(5);

        let session = sm.get(5).expect("mapping should survive reset");
        assert!(session.is_empty());
        assert_eq!(session.total_tokens(), 0);
        assert_eq!(session.last_response(), "");
    }

    #[test]
    fn test_system_message_prepends() {
        let session = Session::new(1);
        session.add_message(Role::User, "q");
        session.add_system_message("context");

        let messages = session.messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
    }
}
