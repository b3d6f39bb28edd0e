use std::fmt;

use shared::agent_api::{ChatMessage, StreamDelta};
use shared::settings::ThinkingStyle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Deltas waiting to be folded. Kept small so a slow consumer paces the transport.
pub const DELTA_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Non-2xx response, connection failure or bridge command rejection.
    #[error("{}", transport_message(.status, .message))]
    Transport { status: Option<u16>, message: String },

    /// A non-streaming body that could not be understood.
    #[error("invalid response: {0}")]
    Parse(String),

    #[error("request cancelled")]
    Cancelled,
}

fn transport_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) if message.trim().is_empty() => format!("API error: HTTP {}", code),
        Some(code) => format!("API error: HTTP {}\n{}", code, message),
        None => format!("request failed: {}", message),
    }
}

impl ProviderError {
    pub fn transport(message: impl Into<String>) -> Self {
        ProviderError::Transport {
            status: None,
            message: message.into(),
        }
    }
}

/// Everything a transport needs to dispatch one completion.
#[derive(Clone)]
pub struct CompletionRequest {
    pub base_url: String,
    pub api_key: Zeroizing<String>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub enable_deep_thinking: bool,
    pub thinking_style: ThinkingStyle,
}

impl fmt::Debug for CompletionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRequest")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("enable_deep_thinking", &self.enable_deep_thinking)
            .field("thinking_style", &self.thinking_style)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionResponse {
    pub content: String,
    pub reasoning_content: Option<String>,
}

pub type DeltaSender = mpsc::Sender<Result<StreamDelta, ProviderError>>;

/// A way of reaching the model endpoint: direct HTTP or a host bridge.
///
/// Chosen once by the hosting application and injected into the client.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Push incremental deltas into `tx` until the stream ends.
    ///
    /// Returning `Err` is fatal for the turn. A closed `tx` means the consumer
    /// went away and the transport should stop quietly.
    async fn stream(
        &self,
        request: CompletionRequest,
        tx: DeltaSender,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Single non-streaming completion.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;
}
