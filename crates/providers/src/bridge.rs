//! Relay transport through a host runtime's command/event bridge.
//!
//! The host owns the HTTP connection. We invoke its streaming command and read
//! `stream-chunk` events (`{content?, reasoning_content?, done?}`) until `done`
//! arrives. Chunks may trail the command result, so after the command returns
//! we keep listening until `done` or a short quiet period.

use serde_json::{json, Value};
use shared::agent_api::StreamDelta;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::openai::ChatCompletionResponse;
use crate::transport::{
    CompletionRequest, CompletionResponse, DeltaSender, ProviderError, Transport,
};

pub const STREAM_COMMAND: &str = "chat_completions_stream";
pub const COMPLETE_COMMAND: &str = "chat_completions";
pub const CANCEL_COMMAND: &str = "cancel_chat_stream";
pub const STREAM_EVENT: &str = "stream-chunk";

/// Quiet period after the command returns before an unterminated stream is
/// considered finished.
const EVENT_GRACE: Duration = Duration::from_secs(2);

/// Host-side command/event channel. Implemented by the embedding application.
#[async_trait::async_trait]
pub trait Bridge: Send + Sync {
    /// Run a host command. The error string is the host's rejection message.
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, String>;

    /// Start receiving payloads emitted on `event`.
    fn listen(&self, event: &str) -> BridgeListener;
}

/// Registered event listener. Dropping it unregisters the listener.
pub struct BridgeListener {
    events: mpsc::UnboundedReceiver<Value>,
    unlisten: Option<Box<dyn FnOnce() + Send>>,
}

impl BridgeListener {
    pub fn new(
        events: mpsc::UnboundedReceiver<Value>,
        unlisten: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            unlisten: Some(Box::new(unlisten)),
        }
    }

    async fn recv(&mut self) -> Option<Value> {
        self.events.recv().await
    }
}

impl Drop for BridgeListener {
    fn drop(&mut self) {
        if let Some(unlisten) = self.unlisten.take() {
            unlisten();
        }
    }
}

pub struct BridgeTransport {
    bridge: Arc<dyn Bridge>,
    grace: Duration,
}

impl BridgeTransport {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self {
            bridge,
            grace: EVENT_GRACE,
        }
    }

    /// How long to keep listening for chunks once the command has returned.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn command_args(request: &CompletionRequest) -> Value {
        json!({
            "baseUrl": request.base_url,
            "apiKey": request.api_key.as_str(),
            "model": request.model,
            "messages": request.messages,
            "enableDeepThinking": request.enable_deep_thinking,
            "thinkingStyle": request.thinking_style,
        })
    }

    /// Ask the host to stop its backing command. Failures are only logged.
    async fn signal_stop(&self) {
        if let Err(e) = self.bridge.invoke(CANCEL_COMMAND, json!({})).await {
            debug!(error = %e, "host did not accept stream cancellation");
        }
    }
}

enum Relay {
    Continue,
    Finished,
}

async fn relay(payload: Value, tx: &DeltaSender) -> Relay {
    let delta: StreamDelta = match serde_json::from_value(payload) {
        Ok(delta) => delta,
        Err(e) => {
            warn!(error = %e, "skipping malformed bridge chunk");
            return Relay::Continue;
        }
    };
    let done = delta.done;
    if delta.is_empty() {
        return Relay::Continue;
    }
    if tx.send(Ok(delta)).await.is_err() || done {
        Relay::Finished
    } else {
        Relay::Continue
    }
}

#[async_trait::async_trait]
impl Transport for BridgeTransport {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        tx: DeltaSender,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        // Listen before invoking so no early chunk is missed.
        let mut listener = self.bridge.listen(STREAM_EVENT);
        let mut invoke = self
            .bridge
            .invoke(STREAM_COMMAND, Self::command_args(&request));

        let mut command_done = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drop(listener);
                    if !command_done {
                        self.signal_stop().await;
                    }
                    return Err(ProviderError::Cancelled);
                }
                result = &mut invoke, if !command_done => {
                    if let Err(message) = result {
                        return Err(ProviderError::transport(message));
                    }
                    // Events may still be in flight behind the command result.
                    debug!("bridge command completed");
                    command_done = true;
                }
                payload = async {
                    if command_done {
                        tokio::time::timeout(self.grace, listener.recv())
                            .await
                            .unwrap_or(None)
                    } else {
                        listener.recv().await
                    }
                } => match payload {
                    Some(payload) => {
                        if let Relay::Finished = relay(payload, &tx).await {
                            return Ok(());
                        }
                    }
                    None => {
                        debug!("bridge stream ended without a done chunk");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let value = self
            .bridge
            .invoke(COMPLETE_COMMAND, Self::command_args(&request))
            .await
            .map_err(ProviderError::transport)?;
        let body: ChatCompletionResponse =
            serde_json::from_value(value).map_err(|e| ProviderError::Parse(e.to_string()))?;
        body.into_completion()
    }
}

/// In-process bridge for tests. Other crates enable it with the `testing` feature.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Plays back a scripted list of event payloads for each streaming invoke.
    #[derive(Default)]
    pub struct ScriptedBridge {
        script: Mutex<Vec<Vec<Value>>>,
        listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<Value>>>>,
        pub invoked: Mutex<Vec<(String, Value)>>,
        pub unlistened: Arc<AtomicBool>,
        reject_with: Mutex<Option<String>>,
        /// When set, the streaming command never returns on its own.
        pub hang: AtomicBool,
        /// When set, events are emitted from a spawned task after the command returns.
        pub deliver_late: AtomicBool,
    }

    impl ScriptedBridge {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the events emitted by the next streaming invoke.
        pub fn push_stream(&self, events: Vec<Value>) {
            self.script.lock().push(events);
        }

        pub fn reject(&self, message: &str) {
            *self.reject_with.lock() = Some(message.to_string());
        }

        pub fn commands(&self) -> Vec<String> {
            self.invoked
                .lock()
                .iter()
                .map(|(c, _)| c.clone())
                .collect()
        }
    }

    fn emit(listeners: &[mpsc::UnboundedSender<Value>], events: Vec<Value>) {
        for event in events {
            for listener in listeners {
                let _ = listener.send(event.clone());
            }
        }
    }

    #[async_trait::async_trait]
    impl Bridge for ScriptedBridge {
        async fn invoke(&self, command: &str, args: Value) -> Result<Value, String> {
            self.invoked.lock().push((command.to_string(), args));
            if command != STREAM_COMMAND {
                return Ok(Value::Null);
            }
            if let Some(message) = self.reject_with.lock().take() {
                return Err(message);
            }
            let events = {
                let mut script = self.script.lock();
                if script.is_empty() {
                    Vec::new()
                } else {
                    script.remove(0)
                }
            };
            let listeners = self.listeners.lock().clone();
            if self.deliver_late.load(Ordering::SeqCst) {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    emit(&listeners, events);
                });
                return Ok(Value::Null);
            }
            emit(&listeners, events);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(Value::Null)
        }

        fn listen(&self, _event: &str) -> BridgeListener {
            let (tx, rx) = mpsc::unbounded_channel();
            self.listeners.lock().push(tx);
            let listeners = self.listeners.clone();
            let flag = self.unlistened.clone();
            BridgeListener::new(rx, move || {
                listeners.lock().clear();
                flag.store(true, Ordering::SeqCst);
            })
        }
    }
}
