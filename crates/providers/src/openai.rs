use serde::{Deserialize, Serialize};
use shared::agent_api::{ChatMessage, StreamDelta};
use shared::settings::ThinkingStyle;
use tracing::warn;

use crate::transport::{CompletionRequest, CompletionResponse, ProviderError};

/// Characters per replayed delta when a provider answers a streaming request
/// with a single JSON body.
pub const REPLAY_SLICE_CHARS: usize = 5;

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingParam>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkingParam {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl<'a> ChatCompletionRequest<'a> {
    pub fn new(request: &'a CompletionRequest, stream: bool) -> Self {
        let (reasoning_effort, thinking) =
            thinking_fields(request.thinking_style, request.enable_deep_thinking);
        Self {
            model: &request.model,
            messages: &request.messages,
            stream,
            reasoning_effort,
            thinking,
        }
    }
}

/// Deep-thinking switch in the shape the model's provider expects.
pub fn thinking_fields(
    style: ThinkingStyle,
    enabled: bool,
) -> (Option<&'static str>, Option<ThinkingParam>) {
    match style {
        ThinkingStyle::ReasoningEffort => (enabled.then_some("high"), None),
        ThinkingStyle::ThinkingObject => (
            None,
            Some(ThinkingParam {
                kind: if enabled { "enabled" } else { "disabled" },
            }),
        ),
        ThinkingStyle::None => (None, None),
    }
}

pub fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

// ── Non-streaming response types ─────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl ChatCompletionResponse {
    pub fn into_completion(self) -> Result<CompletionResponse, ProviderError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Parse("response contained no choices".into()))?;
        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            reasoning_content: choice.message.reasoning_content.filter(|r| !r.is_empty()),
        })
    }
}

// ── Streaming response types ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// Decode one `data:` payload. Malformed payloads are logged and skipped.
pub fn parse_stream_data(data: &str) -> Option<StreamDelta> {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "skipping malformed stream chunk");
            return None;
        }
    };
    let delta = chunk.choices.into_iter().next()?.delta?;
    Some(StreamDelta {
        content: delta.content,
        reasoning_content: delta.reasoning_content,
        done: false,
    })
}

/// Replay a full response as a delta sequence: reasoning once, then the
/// content in short slices, then a terminator.
pub fn replay_deltas(response: &CompletionResponse) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    if let Some(reasoning) = response.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
        deltas.push(StreamDelta::reasoning(reasoning));
    }
    let chars: Vec<char> = response.content.chars().collect();
    for slice in chars.chunks(REPLAY_SLICE_CHARS) {
        deltas.push(StreamDelta::content(slice.iter().collect::<String>()));
    }
    deltas.push(StreamDelta::done());
    deltas
}
