//! Conversation persistence: sessions, their messages and the current selection.
//!
//! Sessions are kept most-recently-active first. Every mutation happens under
//! one write lock and is announced to subscribers. Structural changes are
//! written through at once; streamed message edits only mark the store dirty
//! and reach storage on the next [`SessionStore::flush`].

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::events::SessionEvent;
use shared::{Message, NewMessage, Role, Session};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::storage::{self, KeyValueStore, MemoryStore, StorageError};

pub const SESSIONS_KEY: &str = "chat-sessions";
pub const SESSIONS_VERSION: u32 = 1;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionsState {
    pub sessions: Vec<Session>,
    pub current_session_id: Option<String>,
}

struct Inner {
    state: RwLock<SessionsState>,
    storage: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<SessionEvent>,
    /// In-memory state is ahead of storage.
    dirty: AtomicBool,
    /// Held across snapshot and write so an older snapshot never lands last.
    persist_lock: Mutex<()>,
}

impl Inner {
    fn new(state: SessionsState, storage: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(state),
            storage,
            events,
            dirty: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        }
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Result<Self, StorageError> {
        let state: SessionsState = storage::load_versioned(
            storage.as_ref(),
            SESSIONS_KEY,
            SESSIONS_VERSION,
            migrate_sessions,
        )?;
        debug!(sessions = state.sessions.len(), "session store loaded");
        Ok(Self {
            inner: Arc::new(Inner::new(state, storage)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner::new(
                SessionsState::default(),
                Arc::new(MemoryStore::new()),
            )),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.state.read().sessions.clone()
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.inner
            .state
            .read()
            .sessions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.inner.state.read().current_session_id.clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        let state = self.inner.state.read();
        let id = state.current_session_id.as_deref()?;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    /// Apply `f` under the write lock and write the result through.
    /// `None` from `f` means nothing changed: no write, no events.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut SessionsState) -> Option<(R, Vec<SessionEvent>)>,
    ) -> Option<R> {
        self.apply(true, f)
    }

    fn apply<R>(
        &self,
        write_through: bool,
        f: impl FnOnce(&mut SessionsState) -> Option<(R, Vec<SessionEvent>)>,
    ) -> Option<R> {
        let (result, events) = {
            let mut state = self.inner.state.write();
            let outcome = f(&mut state)?;
            self.inner.dirty.store(true, Ordering::SeqCst);
            outcome
        };
        if write_through {
            if let Err(e) = self.persist() {
                warn!(error = %e, "failed to persist sessions");
            }
        }
        for event in events {
            // No subscribers is fine.
            let _ = self.inner.events.send(event);
        }
        Some(result)
    }

    /// Snapshot under a read lock, then write without holding it.
    fn persist(&self) -> Result<(), StorageError> {
        let _writer = self.inner.persist_lock.lock();
        self.inner.dirty.store(false, Ordering::SeqCst);
        let snapshot = self.inner.state.read().clone();
        storage::save_versioned(
            self.inner.storage.as_ref(),
            SESSIONS_KEY,
            SESSIONS_VERSION,
            &snapshot,
        )
        .inspect_err(|_| self.inner.dirty.store(true, Ordering::SeqCst))
    }

    /// Write pending deferred edits. A no-op when storage is current.
    /// Blocks on file I/O; async callers should run it on a blocking thread.
    pub fn flush(&self) -> Result<(), StorageError> {
        if !self.inner.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.persist()
    }

    /// New empty session at the front of the list; becomes current.
    pub fn create_session(&self) -> String {
        let session = Session::new();
        let id = session.id.clone();
        self.mutate(|state| {
            state.sessions.insert(0, session);
            state.current_session_id = Some(id.clone());
            Some((
                (),
                vec![
                    SessionEvent::Created {
                        session_id: id.clone(),
                    },
                    SessionEvent::Selected {
                        session_id: Some(id.clone()),
                    },
                ],
            ))
        });
        id
    }

    /// Remove a session. A deleted current session hands over to the new front one.
    pub fn delete_session(&self, id: &str) -> bool {
        self.mutate(|state| {
            let pos = state.sessions.iter().position(|s| s.id == id)?;
            state.sessions.remove(pos);
            let mut events = vec![SessionEvent::Deleted {
                session_id: id.to_string(),
            }];
            if state.current_session_id.as_deref() == Some(id) {
                state.current_session_id = state.sessions.first().map(|s| s.id.clone());
                events.push(SessionEvent::Selected {
                    session_id: state.current_session_id.clone(),
                });
            }
            Some(((), events))
        })
        .is_some()
    }

    /// Make `id` current. Unknown ids are ignored.
    pub fn select_session(&self, id: &str) -> bool {
        self.mutate(|state| {
            if !state.sessions.iter().any(|s| s.id == id) {
                return None;
            }
            state.current_session_id = Some(id.to_string());
            Some((
                (),
                vec![SessionEvent::Selected {
                    session_id: Some(id.to_string()),
                }],
            ))
        })
        .is_some()
    }

    /// Append a message with a fresh id and timestamp, and move the session to
    /// the front. The first user message of an untitled session names it.
    pub fn add_message(&self, session_id: &str, message: NewMessage) -> Option<Message> {
        self.mutate(|state| {
            let pos = state.sessions.iter().position(|s| s.id == session_id)?;
            let mut session = state.sessions.remove(pos);
            let message = message.into_message(Utc::now());
            let mut events = Vec::new();

            if session.messages.is_empty()
                && message.role == Role::User
                && session.title == Session::DEFAULT_TITLE
            {
                session.title = Session::derive_title(&message.content);
                events.push(SessionEvent::TitleChanged {
                    session_id: session.id.clone(),
                    title: session.title.clone(),
                });
            }
            session.messages.push(message.clone());
            session.touch();
            state.sessions.insert(0, session);

            events.insert(
                0,
                SessionEvent::MessageAdded {
                    session_id: session_id.to_string(),
                    message_id: message.id.clone(),
                },
            );
            Some((message, events))
        })
    }

    /// Replace a message's content, and its thinking text when given.
    /// Keeps list order. No-op when either id is unknown.
    pub fn update_message(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        thinking_content: Option<&str>,
    ) -> bool {
        self.mutate(|state| set_message(state, session_id, message_id, content, thinking_content))
            .is_some()
    }

    /// Same as [`update_message`](Self::update_message) but leaves the write
    /// to the next [`flush`](Self::flush). Used for streamed snapshots.
    pub fn update_message_deferred(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        thinking_content: Option<&str>,
    ) -> bool {
        self.apply(false, |state| {
            set_message(state, session_id, message_id, content, thinking_content)
        })
        .is_some()
    }

    pub fn update_session_title(&self, session_id: &str, title: &str) -> bool {
        self.mutate(|state| {
            let session = state.sessions.iter_mut().find(|s| s.id == session_id)?;
            session.title = title.to_string();
            session.touch();
            Some((
                (),
                vec![SessionEvent::TitleChanged {
                    session_id: session_id.to_string(),
                    title: title.to_string(),
                }],
            ))
        })
        .is_some()
    }

    /// Delete a message together with its turn partner.
    ///
    /// A user message takes the assistant reply right after it, if any. An
    /// assistant message takes the user message right before it, if any.
    /// Returns the removed ids in message order.
    pub fn delete_message_pair(&self, session_id: &str, message_id: &str) -> Vec<String> {
        self.mutate(|state| {
            let session = state.sessions.iter_mut().find(|s| s.id == session_id)?;
            let idx = session.messages.iter().position(|m| m.id == message_id)?;
            let role_at = |i: usize| session.messages.get(i).map(|m| m.role);

            let range = match session.messages[idx].role {
                Role::User if role_at(idx + 1) == Some(Role::Assistant) => idx..idx + 2,
                Role::Assistant if idx > 0 && role_at(idx - 1) == Some(Role::User) => {
                    idx - 1..idx + 1
                }
                _ => idx..idx + 1,
            };
            let removed: Vec<String> = session.messages.drain(range).map(|m| m.id).collect();
            session.touch();
            Some((
                removed.clone(),
                vec![SessionEvent::MessagesRemoved {
                    session_id: session_id.to_string(),
                    message_ids: removed,
                }],
            ))
        })
        .unwrap_or_default()
    }

    pub fn delete_last_message(&self, session_id: &str) -> Option<Message> {
        self.mutate(|state| {
            let session = state.sessions.iter_mut().find(|s| s.id == session_id)?;
            let message = session.messages.pop()?;
            session.touch();
            let event = SessionEvent::MessagesRemoved {
                session_id: session_id.to_string(),
                message_ids: vec![message.id.clone()],
            };
            Some((message, vec![event]))
        })
    }

    pub fn get_last_user_message(&self, session_id: &str) -> Option<Message> {
        let state = self.inner.state.read();
        state
            .sessions
            .iter()
            .find(|s| s.id == session_id)?
            .last_user_message()
            .cloned()
    }

    /// Render a session as a Markdown transcript.
    pub fn export_markdown(&self, session_id: &str) -> Option<String> {
        let session = self.session(session_id)?;
        let mut out = String::new();
        let _ = writeln!(out, "# {}\n", session.title);
        let _ = writeln!(
            out,
            "_Created {}, updated {}_\n",
            session.created_at.format("%Y-%m-%d %H:%M UTC"),
            session.updated_at.format("%Y-%m-%d %H:%M UTC"),
        );

        for message in &session.messages {
            let heading = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            let _ = writeln!(
                out,
                "## {} ({})\n",
                heading,
                message.timestamp.format("%H:%M:%S")
            );
            if let Some(thinking) = message.thinking_content.as_deref().filter(|t| !t.is_empty())
            {
                for line in thinking.lines() {
                    let _ = writeln!(out, "> {}", line);
                }
                out.push('\n');
            }
            if let Some(attachments) = &message.attachments {
                for attachment in attachments {
                    let _ = writeln!(
                        out,
                        "- 📎 {} ({}, {} bytes)",
                        attachment.name,
                        attachment.kind.as_str(),
                        attachment.size
                    );
                }
                out.push('\n');
            }
            let _ = writeln!(out, "{}\n", message.content.trim_end());
        }
        Some(out)
    }
}

fn set_message(
    state: &mut SessionsState,
    session_id: &str,
    message_id: &str,
    content: &str,
    thinking_content: Option<&str>,
) -> Option<((), Vec<SessionEvent>)> {
    let session = state.sessions.iter_mut().find(|s| s.id == session_id)?;
    let message = session.messages.iter_mut().find(|m| m.id == message_id)?;
    message.content = content.to_string();
    if let Some(thinking) = thinking_content {
        message.thinking_content = Some(thinking.to_string());
    }
    session.touch();
    Some((
        (),
        vec![SessionEvent::MessageUpdated {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
        }],
    ))
}

/// Version 0 state wrote timestamps as epoch milliseconds and could omit
/// titles. Rewrite it into the current shape.
fn migrate_sessions(mut state: Value, from: u32) -> Value {
    if from >= 1 {
        return state;
    }
    if let Some(sessions) = state.get_mut("sessions").and_then(Value::as_array_mut) {
        for session in sessions {
            for field in ["createdAt", "updatedAt"] {
                millis_to_rfc3339(session, field);
            }
            if session.get("title").and_then(Value::as_str).is_none() {
                session["title"] = Value::from(Session::DEFAULT_TITLE);
            }
            match session.get_mut("messages").and_then(Value::as_array_mut) {
                Some(messages) => {
                    for message in messages {
                        millis_to_rfc3339(message, "timestamp");
                    }
                }
                None => session["messages"] = Value::Array(Vec::new()),
            }
        }
    }
    state
}

fn millis_to_rfc3339(object: &mut Value, field: &str) {
    let Some(ms) = object.get(field).and_then(Value::as_i64) else {
        return;
    };
    if let Some(ts) = DateTime::<Utc>::from_timestamp_millis(ms) {
        object[field] = Value::from(ts.to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JsonFileStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingStore {
        inner: MemoryStore,
        saves: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                saves: AtomicUsize::new(0),
            }
        }

        fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    impl KeyValueStore for CountingStore {
        fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, value: &Value) -> Result<(), StorageError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(key, value)
        }
    }

    fn store_with(messages: &[(Role, &str)]) -> (SessionStore, String, Vec<String>) {
        let store = SessionStore::in_memory();
        let id = store.create_session();
        let ids = messages
            .iter()
            .map(|(role, text)| store.add_message(&id, NewMessage::new(*role, *text)).unwrap().id)
            .collect();
        (store, id, ids)
    }

    fn contents(store: &SessionStore, id: &str) -> Vec<String> {
        store
            .session(id)
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[test]
    fn test_create_session_is_front_and_current() {
        let store = SessionStore::in_memory();
        let first = store.create_session();
        let second = store.create_session();
        let ids: Vec<_> = store.sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![second.clone(), first]);
        assert_eq!(store.current_session_id(), Some(second));
    }

    #[test]
    fn test_delete_current_session_selects_front() {
        let store = SessionStore::in_memory();
        let a = store.create_session();
        let b = store.create_session();
        let c = store.create_session();
        assert!(store.select_session(&a));
        assert!(store.delete_session(&a));
        assert_eq!(store.current_session_id(), Some(c.clone()));

        assert!(store.delete_session(&b));
        assert_eq!(store.current_session_id(), Some(c.clone()));
        assert!(store.delete_session(&c));
        assert_eq!(store.current_session_id(), None);
        assert!(!store.delete_session("missing"));
    }

    #[test]
    fn test_select_unknown_is_ignored() {
        let store = SessionStore::in_memory();
        let id = store.create_session();
        assert!(!store.select_session("nope"));
        assert_eq!(store.current_session_id(), Some(id));
    }

    #[test]
    fn test_first_user_message_names_session() {
        let (store, id, _) = store_with(&[
            (Role::User, "Explain borrow checking in detail please"),
            (Role::User, "Something else entirely"),
        ]);
        assert_eq!(store.session(&id).unwrap().title, "Explain borrow check");
    }

    #[test]
    fn test_assistant_first_keeps_default_title() {
        let (store, id, _) = store_with(&[(Role::Assistant, "Hello!")]);
        assert_eq!(store.session(&id).unwrap().title, Session::DEFAULT_TITLE);
    }

    #[test]
    fn test_add_message_moves_to_front_and_updated_at_never_decreases() {
        let store = SessionStore::in_memory();
        let a = store.create_session();
        let b = store.create_session();
        let mut last = store.session(&a).unwrap().updated_at;

        for (i, target) in [&a, &b, &a, &a, &b].into_iter().enumerate() {
            let before = store.session(target).unwrap().updated_at;
            store
                .add_message(target, NewMessage::user(format!("m{}", i)))
                .unwrap();
            let session = store.session(target).unwrap();
            assert!(session.updated_at >= before);
            assert_eq!(store.sessions()[0].id, *target);
            if target == &a {
                assert!(session.updated_at >= last);
                last = session.updated_at;
            }
        }
        assert!(store.add_message("missing", NewMessage::user("x")).is_none());
    }

    #[test]
    fn test_update_message_keeps_order() {
        let store = SessionStore::in_memory();
        let a = store.create_session();
        let msg = store.add_message(&a, NewMessage::assistant("")).unwrap();
        let b = store.create_session();
        store.add_message(&b, NewMessage::user("newer")).unwrap();

        assert!(store.update_message(&a, &msg.id, "streamed", Some("thought")));
        assert_eq!(store.sessions()[0].id, b);
        let updated = store.session(&a).unwrap().messages[0].clone();
        assert_eq!(updated.content, "streamed");
        assert_eq!(updated.thinking_content.as_deref(), Some("thought"));

        assert!(store.update_message(&a, &msg.id, "final", None));
        let updated = store.session(&a).unwrap().messages[0].clone();
        assert_eq!(updated.thinking_content.as_deref(), Some("thought"));

        assert!(!store.update_message(&a, "missing", "x", None));
        assert!(!store.update_message("missing", &msg.id, "x", None));
    }

    #[test]
    fn test_delete_pair_from_user_takes_following_reply() {
        let (store, id, ids) = store_with(&[
            (Role::User, "q1"),
            (Role::Assistant, "a1"),
            (Role::User, "q2"),
            (Role::Assistant, "a2"),
        ]);
        let removed = store.delete_message_pair(&id, &ids[0]);
        assert_eq!(removed, vec![ids[0].clone(), ids[1].clone()]);
        assert_eq!(contents(&store, &id), vec!["q2", "a2"]);
    }

    #[test]
    fn test_delete_pair_from_user_without_reply() {
        let (store, id, ids) = store_with(&[
            (Role::User, "q1"),
            (Role::User, "q2"),
            (Role::Assistant, "a2"),
        ]);
        assert_eq!(store.delete_message_pair(&id, &ids[0]), vec![ids[0].clone()]);
        assert_eq!(contents(&store, &id), vec!["q2", "a2"]);

        let (store, id, ids) =
            store_with(&[(Role::User, "q1"), (Role::Assistant, "a1"), (Role::User, "q2")]);
        assert_eq!(store.delete_message_pair(&id, &ids[2]), vec![ids[2].clone()]);
        assert_eq!(contents(&store, &id), vec!["q1", "a1"]);
    }

    #[test]
    fn test_delete_pair_from_assistant_takes_preceding_user() {
        let (store, id, ids) = store_with(&[
            (Role::User, "q1"),
            (Role::Assistant, "a1"),
            (Role::User, "q2"),
            (Role::Assistant, "a2"),
        ]);
        let removed = store.delete_message_pair(&id, &ids[3]);
        assert_eq!(removed, vec![ids[2].clone(), ids[3].clone()]);
        assert_eq!(contents(&store, &id), vec!["q1", "a1"]);

        let (store, id, ids) = store_with(&[(Role::Assistant, "greeting"), (Role::User, "q")]);
        assert_eq!(store.delete_message_pair(&id, &ids[0]), vec![ids[0].clone()]);
        assert!(store.delete_message_pair(&id, "missing").is_empty());
    }

    #[test]
    fn test_delete_last_and_last_user_message() {
        let (store, id, _) = store_with(&[(Role::User, "Q"), (Role::Assistant, "stale")]);
        assert_eq!(store.get_last_user_message(&id).unwrap().content, "Q");
        assert_eq!(store.delete_last_message(&id).unwrap().content, "stale");
        assert_eq!(store.delete_last_message(&id).unwrap().content, "Q");
        assert!(store.delete_last_message(&id).is_none());
        assert!(store.get_last_user_message(&id).is_none());
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(dir.path()));
        let store = SessionStore::load(storage.clone()).unwrap();
        let id = store.create_session();
        store.add_message(&id, NewMessage::user("persist me")).unwrap();

        let reloaded = SessionStore::load(storage).unwrap();
        assert_eq!(reloaded.current_session_id(), Some(id.clone()));
        assert_eq!(contents(&reloaded, &id), vec!["persist me"]);
        assert_eq!(reloaded.session(&id).unwrap().title, "persist me");
    }

    #[test]
    fn test_deferred_updates_wait_for_flush() {
        let storage = Arc::new(CountingStore::new());
        let store = SessionStore::load(storage.clone()).unwrap();
        let id = store.create_session();
        let msg = store.add_message(&id, NewMessage::assistant("")).unwrap();
        let saved = storage.saves();
        let mut rx = store.subscribe();

        for text in ["a", "ab", "abc"] {
            assert!(store.update_message_deferred(&id, &msg.id, text, Some("t")));
        }
        assert!(!store.update_message_deferred(&id, "missing", "x", None));
        assert_eq!(storage.saves(), saved);
        assert_eq!(contents(&store, &id), vec!["abc"]);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::MessageUpdated { .. }));

        store.flush().unwrap();
        store.flush().unwrap();
        assert_eq!(storage.saves(), saved + 1);

        let reloaded = SessionStore::load(storage).unwrap();
        let message = reloaded.session(&id).unwrap().messages[0].clone();
        assert_eq!(message.content, "abc");
        assert_eq!(message.thinking_content.as_deref(), Some("t"));
    }

    #[test]
    fn test_write_through_clears_pending_flush() {
        let storage = Arc::new(CountingStore::new());
        let store = SessionStore::load(storage.clone()).unwrap();
        let id = store.create_session();
        let msg = store.add_message(&id, NewMessage::assistant("")).unwrap();

        store.update_message_deferred(&id, &msg.id, "draft", None);
        store.update_session_title(&id, "Renamed");
        let saved = storage.saves();
        store.flush().unwrap();
        assert_eq!(storage.saves(), saved);
        assert_eq!(contents(&SessionStore::load(storage).unwrap(), &id), vec!["draft"]);
    }

    #[test]
    fn test_legacy_millisecond_timestamps_are_migrated() {
        let storage = Arc::new(MemoryStore::new());
        storage
            .save(
                SESSIONS_KEY,
                &json!({
                    "sessions": [{
                        "id": "s1",
                        "createdAt": 1_700_000_000_000i64,
                        "updatedAt": 1_700_000_100_000i64,
                        "messages": [{
                            "id": "m1",
                            "role": "user",
                            "content": "old",
                            "timestamp": 1_700_000_050_000i64
                        }]
                    }],
                    "currentSessionId": "s1"
                }),
            )
            .unwrap();

        let store = SessionStore::load(storage.clone()).unwrap();
        let session = store.session("s1").unwrap();
        assert_eq!(session.title, Session::DEFAULT_TITLE);
        assert_eq!(session.created_at.timestamp(), 1_700_000_000);
        assert_eq!(session.messages[0].timestamp.timestamp(), 1_700_000_050);
        assert_eq!(storage.load(SESSIONS_KEY).unwrap().unwrap()["version"], 1);
    }

    #[test]
    fn test_subscribers_see_changes() {
        let store = SessionStore::in_memory();
        let mut rx = store.subscribe();
        let id = store.create_session();
        let msg = store.add_message(&id, NewMessage::user("hi")).unwrap();

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Created { session_id: id.clone() });
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Selected { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::MessageAdded {
                session_id: id.clone(),
                message_id: msg.id
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::TitleChanged { .. }));
    }

    #[test]
    fn test_export_markdown() {
        let (store, id, ids) = store_with(&[(Role::User, "What is 2+2?"), (Role::Assistant, "")]);
        store.update_message(&id, &ids[1], "4", Some("simple sum\nno tricks"));
        let md = store.export_markdown(&id).unwrap();

        assert!(md.starts_with("# What is 2+2?\n"));
        assert!(md.contains("## User"));
        assert!(md.contains("> simple sum\n> no tricks\n"));
        assert!(md.trim_end().ends_with('4'));
        assert!(store.export_markdown("missing").is_none());
    }
}
