//! Drives one chat turn at a time: records the user message, streams the
//! reply into a placeholder assistant message, and releases the lock however
//! the stream ends.
//!
//! Streamed snapshots only touch the in-memory session. They are written out
//! on a blocking thread every [`FLUSH_INTERVAL`] and once more when the turn ends.

use parking_lot::Mutex;
use providers::{CancelHandle, CompletionClient, CompletionRequest, ProviderError, StreamState};
use services::settings_store::ResolvedModel;
use services::{SessionStore, SettingsError, SettingsStore, VaultError};
use shared::{FileAttachment, NewMessage, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::to_chat_messages;

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("a response is already being generated")]
    Busy,

    #[error("conversation not found")]
    NoSession,

    #[error("there is no user message to regenerate from")]
    NothingToRegenerate,

    #[error("nothing to send")]
    EmptyInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// The reply holds an error block instead of model output.
    Failed,
    /// Stopped by the user; the reply keeps what had arrived.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    pub assistant_message_id: String,
    pub status: TurnStatus,
}

/// Clears the generating flag and the active cancel handle on drop.
struct GenerationGuard<'a> {
    orchestrator: &'a Orchestrator,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.active.lock().take();
        self.orchestrator.generating.store(false, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    sessions: SessionStore,
    settings: SettingsStore,
    client: CompletionClient,
    generating: AtomicBool,
    active: Mutex<Option<CancelHandle>>,
}

impl Orchestrator {
    pub fn new(sessions: SessionStore, settings: SettingsStore, client: CompletionClient) -> Self {
        Self {
            sessions,
            settings,
            client,
            generating: AtomicBool::new(false),
            active: Mutex::new(None),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<GenerationGuard<'_>, TurnError> {
        self.generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TurnError::Busy)?;
        Ok(GenerationGuard { orchestrator: self })
    }

    /// Stop the turn in flight. Returns whether there was one.
    pub fn stop(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(handle) => {
                info!("stopping generation");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Send a user message to the current conversation, creating one if
    /// none is selected, and stream the reply.
    pub async fn send(
        &self,
        text: &str,
        attachments: Vec<FileAttachment>,
    ) -> Result<TurnOutcome, TurnError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(TurnError::EmptyInput);
        }
        let _guard = self.begin()?;

        let session_id = match self.sessions.current_session_id() {
            Some(id) => id,
            None => self.sessions.create_session(),
        };
        self.sessions
            .add_message(
                &session_id,
                NewMessage::user(text.trim()).with_attachments(attachments),
            )
            .ok_or(TurnError::NoSession)?;
        Ok(self.run_turn(&session_id).await)
    }

    /// Drop the trailing assistant reply and answer the last user message again.
    pub async fn regenerate(&self, session_id: &str) -> Result<TurnOutcome, TurnError> {
        let _guard = self.begin()?;
        let session = self
            .sessions
            .session(session_id)
            .ok_or(TurnError::NoSession)?;
        if session.last_user_message().is_none() {
            return Err(TurnError::NothingToRegenerate);
        }
        if session.messages.last().map(|m| m.role) == Some(Role::Assistant) {
            self.sessions.delete_last_message(session_id);
        }
        debug!(session_id, "regenerating reply");
        Ok(self.run_turn(session_id).await)
    }

    /// Paired delete. Refused while a reply is streaming.
    pub fn delete_message_pair(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Vec<String>, TurnError> {
        if self.is_generating() {
            return Err(TurnError::Busy);
        }
        Ok(self.sessions.delete_message_pair(session_id, message_id))
    }

    /// Stream a reply to the session's current history. Never fails: errors
    /// end up as the reply text.
    async fn run_turn(&self, session_id: &str) -> TurnOutcome {
        let history = self
            .sessions
            .session(session_id)
            .map(|s| s.messages)
            .unwrap_or_default();
        let placeholder = self
            .sessions
            .add_message(session_id, NewMessage::assistant(""))
            .map(|m| m.id)
            .unwrap_or_default();
        let outcome = |status| TurnOutcome {
            session_id: session_id.to_string(),
            assistant_message_id: placeholder.clone(),
            status,
        };

        let resolved = match self.resolve_model().await {
            Ok(resolved) => resolved,
            Err(message) => {
                self.sessions
                    .update_message_deferred(session_id, &placeholder, &message, None);
                self.flush_sessions().await;
                return outcome(TurnStatus::Failed);
            }
        };

        let request = CompletionRequest {
            base_url: resolved.model.base_url.clone(),
            api_key: resolved.api_key,
            model: resolved.model.name.clone(),
            messages: to_chat_messages(&history, resolved.model.is_multimodal),
            enable_deep_thinking: resolved.enable_deep_thinking,
            thinking_style: resolved.model.thinking_style,
        };
        let mut stream = self.client.stream(request);
        *self.active.lock() = Some(stream.cancel_handle());
        info!(
            session_id,
            model = %resolved.model.name,
            transport = self.client.transport_name(),
            "generating reply"
        );

        let mut status = TurnStatus::Completed;
        let mut last_flush = Instant::now();
        while let Some(item) = stream.next().await {
            match item {
                Ok(snapshot) => {
                    self.sessions.update_message_deferred(
                        session_id,
                        &placeholder,
                        snapshot.content.as_deref().unwrap_or_default(),
                        snapshot.thinking_content.as_deref(),
                    );
                }
                Err(e) => {
                    error!(session_id, error = %e, "generation failed");
                    self.sessions.update_message_deferred(
                        session_id,
                        &placeholder,
                        &error_block(&e),
                        None,
                    );
                    status = TurnStatus::Failed;
                }
            }
            if last_flush.elapsed() >= FLUSH_INTERVAL {
                self.flush_sessions().await;
                last_flush = Instant::now();
            }
        }
        self.flush_sessions().await;
        if stream.state() == StreamState::Cancelled {
            status = TurnStatus::Cancelled;
        }
        debug!(session_id, ?status, "turn finished");
        outcome(status)
    }

    async fn flush_sessions(&self) {
        let sessions = self.sessions.clone();
        match tokio::task::spawn_blocking(move || sessions.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist streamed reply"),
            Err(e) => error!(error = %e, "session flush task failed"),
        }
    }

    /// Current model with its key opened, or the text to show instead.
    async fn resolve_model(&self) -> Result<ResolvedModel, String> {
        let settings = self.settings.clone();
        // Key derivation is CPU-bound; keep it off the executor.
        match tokio::task::spawn_blocking(move || settings.resolve_current()).await {
            Ok(Ok(resolved)) => Ok(resolved),
            Ok(Err(e)) => {
                warn!(error = %e, "cannot resolve current model");
                Err(settings_error_text(&e))
            }
            Err(e) => {
                error!(error = %e, "model resolution task failed");
                Err(format!("**Error:** {}", e))
            }
        }
    }
}

fn settings_error_text(error: &SettingsError) -> String {
    match error {
        SettingsError::NoCurrentModel => {
            "**No model configured.** Add a model in settings, then try again.".to_string()
        }
        SettingsError::Vault(
            VaultError::Decryption | VaultError::UnknownVersion | VaultError::Malformed,
        ) => {
            "**Your API key could not be decrypted on this device.** \
             Please re-enter the key for this model in settings."
                .to_string()
        }
        other => format!("**Error:** {}", other),
    }
}

/// Readable reply text for a failed request, with a hint where one helps.
fn error_block(error: &ProviderError) -> String {
    let detail = error.to_string();
    let lower = detail.to_lowercase();
    let hint = match error {
        ProviderError::Transport {
            status: Some(401 | 403),
            ..
        } => Some("The provider rejected the API key. Check the key configured for this model."),
        ProviderError::Transport {
            status: Some(429), ..
        } => Some("The provider is rate limiting requests. Wait a moment and try again."),
        ProviderError::Transport { status: None, .. }
            if ["connection", "timed out", "timeout", "dns", "resolve"]
                .iter()
                .any(|needle| lower.contains(needle)) =>
        {
            Some("Could not reach the provider. Check the network connection and base URL.")
        }
        _ if lower.contains("quota") || lower.contains("insufficient") => {
            Some("The account quota for this provider may be exhausted.")
        }
        _ => None,
    };
    let mut text = String::from("**Error:** the model request failed.");
    if let Some(hint) = hint {
        text.push(' ');
        text.push_str(hint);
    }
    text.push_str("\n\n```\n");
    text.push_str(detail.trim_end());
    text.push_str("\n```");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use providers::bridge::testing::ScriptedBridge;
    use providers::bridge::STREAM_COMMAND;
    use serde_json::{json, Value};
    use services::vault::StaticFingerprint;
    use services::{CredentialVault, KeyValueStore, MemoryStore, StorageError};
    use shared::settings::ModelDraft;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        saves: AtomicUsize,
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

    fn vault(device: &str) -> CredentialVault {
        CredentialVault::new(Arc::new(StaticFingerprint(vec![device.into()])))
    }

    fn model() -> ModelDraft {
        ModelDraft {
            name: "chat-model".into(),
            platform: "custom".into(),
            base_url: "https://api.example.com/v1".into(),
            api_key: "sk-orchestrator".into(),
            is_default: true,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<Orchestrator>, Arc<ScriptedBridge>) {
        let bridge = Arc::new(ScriptedBridge::new());
        let settings = SettingsStore::in_memory(vault("device"));
        settings.add_model(model());
        let orchestrator = Orchestrator::new(
            SessionStore::in_memory(),
            settings,
            CompletionClient::bridge(bridge.clone()),
        );
        (Arc::new(orchestrator), bridge)
    }

    fn transcript(orchestrator: &Orchestrator, session_id: &str) -> Vec<(Role, String)> {
        orchestrator
            .sessions()
            .session(session_id)
            .unwrap()
            .messages
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect()
    }

    #[tokio::test]
    async fn test_send_streams_reply_into_assistant_message() {
        let (orchestrator, bridge) = setup();
        bridge.push_stream(vec![
            json!({"reasoning_content": "thinking"}),
            json!({"content": "Hi "}),
            json!({"content": "there"}),
            json!({"done": true}),
        ]);

        let outcome = orchestrator.send("Hello", vec![]).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert!(!orchestrator.is_generating());

        let session = orchestrator.sessions().session(&outcome.session_id).unwrap();
        assert_eq!(session.title, "Hello");
        assert_eq!(session.messages.len(), 2);
        let reply = session.message(&outcome.assistant_message_id).unwrap();
        assert_eq!(reply.content, "Hi there");
        assert_eq!(reply.thinking_content.as_deref(), Some("thinking"));

        let invoked = bridge.invoked.lock();
        let (command, args) = &invoked[0];
        assert_eq!(command, STREAM_COMMAND);
        assert_eq!(args["apiKey"], "sk-orchestrator");
        assert_eq!(args["model"], "chat-model");
        assert_eq!(args["messages"], json!([{"role": "user", "content": "Hello"}]));
    }

    #[tokio::test]
    async fn test_reply_arriving_after_command_returns() {
        let (orchestrator, bridge) = setup();
        bridge.deliver_late.store(true, Ordering::SeqCst);
        bridge.push_stream(vec![
            json!({"content": "Hello"}),
            json!({"content": " world"}),
            json!({"done": true}),
        ]);

        let outcome = orchestrator.send("Hi", vec![]).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(
            transcript(&orchestrator, &outcome.session_id),
            vec![
                (Role::User, "Hi".to_string()),
                (Role::Assistant, "Hello world".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_streamed_snapshots_are_not_written_one_by_one() {
        let storage = Arc::new(CountingStore::default());
        let bridge = Arc::new(ScriptedBridge::new());
        let settings = SettingsStore::in_memory(vault("device"));
        settings.add_model(model());
        let orchestrator = Orchestrator::new(
            SessionStore::load(storage.clone()).unwrap(),
            settings,
            CompletionClient::bridge(bridge.clone()),
        );
        let mut events: Vec<_> = (0..200).map(|i| json!({"content": i.to_string()})).collect();
        events.push(json!({"done": true}));
        bridge.push_stream(events);

        let outcome = orchestrator.send("count", vec![]).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        // Session, user message, placeholder, then one flush.
        assert!(storage.saves.load(Ordering::SeqCst) <= 5);

        let expected: String = (0..200).map(|i| i.to_string()).collect();
        let reloaded = SessionStore::load(storage).unwrap();
        let reply = reloaded
            .session(&outcome.session_id)
            .unwrap()
            .message(&outcome.assistant_message_id)
            .cloned()
            .unwrap();
        assert_eq!(reply.content, expected);
    }

    #[tokio::test]
    async fn test_regenerate_replaces_trailing_reply() {
        let (orchestrator, bridge) = setup();
        bridge.push_stream(vec![json!({"content": "stale"}), json!({"done": true})]);
        let first = orchestrator.send("Q", vec![]).await.unwrap();

        bridge.push_stream(vec![json!({"content": "fresh"}), json!({"done": true})]);
        let second = orchestrator.regenerate(&first.session_id).await.unwrap();

        assert_eq!(second.status, TurnStatus::Completed);
        assert_ne!(second.assistant_message_id, first.assistant_message_id);
        assert_eq!(
            transcript(&orchestrator, &first.session_id),
            vec![(Role::User, "Q".to_string()), (Role::Assistant, "fresh".to_string())]
        );

        // The stale reply is not sent back as context.
        let invoked = bridge.invoked.lock();
        assert_eq!(invoked[1].1["messages"], json!([{"role": "user", "content": "Q"}]));
    }

    #[tokio::test]
    async fn test_regenerate_needs_a_user_message() {
        let (orchestrator, _) = setup();
        let id = orchestrator.sessions().create_session();
        assert!(matches!(
            orchestrator.regenerate(&id).await,
            Err(TurnError::NothingToRegenerate)
        ));
        assert!(matches!(
            orchestrator.regenerate("missing").await,
            Err(TurnError::NoSession)
        ));
        assert!(!orchestrator.is_generating());
    }

    #[tokio::test]
    async fn test_transport_error_becomes_reply_text() {
        let (orchestrator, bridge) = setup();
        bridge.reject("API error: HTTP 500\ninternal");

        let outcome = orchestrator.send("Hello", vec![]).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        assert!(!orchestrator.is_generating());

        let session = orchestrator.sessions().session(&outcome.session_id).unwrap();
        let reply = session.message(&outcome.assistant_message_id).unwrap();
        assert!(reply.content.starts_with("**Error:**"));
        assert!(reply.content.contains("HTTP 500"));
    }

    #[test]
    fn test_error_block_hints() {
        let unauthorized = error_block(&ProviderError::Transport {
            status: Some(401),
            message: "invalid key".into(),
        });
        assert!(unauthorized.contains("rejected the API key"));
        assert!(unauthorized.ends_with("invalid key\n```"));

        let offline = error_block(&ProviderError::transport(
            "error sending request: connection refused",
        ));
        assert!(offline.contains("Could not reach the provider"));

        let plain = error_block(&ProviderError::Parse("response contained no choices".into()));
        assert!(plain.starts_with("**Error:** the model request failed.\n\n"));
    }

    #[tokio::test]
    async fn test_missing_model_is_reported() {
        let orchestrator = Orchestrator::new(
            SessionStore::in_memory(),
            SettingsStore::in_memory(vault("device")),
            CompletionClient::bridge(Arc::new(ScriptedBridge::new())),
        );
        let outcome = orchestrator.send("Hello", vec![]).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        let session = orchestrator.sessions().session(&outcome.session_id).unwrap();
        assert!(session.messages[1].content.contains("No model configured"));
    }

    #[tokio::test]
    async fn test_unreadable_key_asks_for_reconfiguration() {
        let storage = Arc::new(MemoryStore::new());
        SettingsStore::load(storage.clone(), vault("old-device"))
            .unwrap()
            .add_model(model());
        let bridge = Arc::new(ScriptedBridge::new());
        let orchestrator = Orchestrator::new(
            SessionStore::in_memory(),
            SettingsStore::load(storage, vault("new-device")).unwrap(),
            CompletionClient::bridge(bridge.clone()),
        );

        let outcome = orchestrator.send("Hello", vec![]).await.unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        let session = orchestrator.sessions().session(&outcome.session_id).unwrap();
        assert!(session.messages[1].content.contains("re-enter the key"));
        assert!(bridge.invoked.lock().is_empty());
    }

    #[tokio::test]
    async fn test_second_send_is_rejected_and_stop_keeps_partial() {
        let (orchestrator, bridge) = setup();
        bridge.hang.store(true, Ordering::SeqCst);
        bridge.push_stream(vec![json!({"content": "partial"})]);

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.send("long question", vec![]).await })
        };

        let session_id = loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let Some(session) = orchestrator.sessions().current_session() else {
                continue;
            };
            if session.messages.len() == 2 && session.messages[1].content == "partial" {
                break session.id;
            }
        };
        assert!(orchestrator.is_generating());
        assert!(matches!(
            orchestrator.send("another", vec![]).await,
            Err(TurnError::Busy)
        ));
        assert!(matches!(
            orchestrator.delete_message_pair(&session_id, "x"),
            Err(TurnError::Busy)
        ));

        assert!(orchestrator.stop());
        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Cancelled);
        assert!(!orchestrator.is_generating());
        assert!(!orchestrator.stop());
        assert_eq!(
            transcript(&orchestrator, &session_id),
            vec![
                (Role::User, "long question".to_string()),
                (Role::Assistant, "partial".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let (orchestrator, _) = setup();
        assert!(matches!(
            orchestrator.send("   ", vec![]).await,
            Err(TurnError::EmptyInput)
        ));
        assert!(orchestrator.sessions().sessions().is_empty());
    }

    #[tokio::test]
    async fn test_delete_pair_when_idle() {
        let (orchestrator, bridge) = setup();
        bridge.push_stream(vec![json!({"content": "A"}), json!({"done": true})]);
        let outcome = orchestrator.send("Q", vec![]).await.unwrap();
        let removed = orchestrator
            .delete_message_pair(&outcome.session_id, &outcome.assistant_message_id)
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert!(transcript(&orchestrator, &outcome.session_id).is_empty());
    }
}
