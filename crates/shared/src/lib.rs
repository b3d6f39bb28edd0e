pub mod attachment;
pub mod events;
pub mod session;

pub use attachment::{AttachmentKind, FileAttachment};
pub use session::{Message, NewMessage, Role, Session};

pub mod settings {
    use serde::{Deserialize, Serialize};

    /// How a provider expects the deep-thinking switch to be expressed on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
    #[serde(rename_all = "snake_case")]
    pub enum ThinkingStyle {
        /// `"reasoning_effort": "high"` when enabled, omitted otherwise.
        ReasoningEffort,
        /// `"thinking": {"type": "enabled" | "disabled"}`, always sent.
        #[default]
        ThinkingObject,
        /// Provider has no such switch.
        None,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Modalities {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub input: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub output: Option<Vec<String>>,
    }

    /// A configured model endpoint. `api_key` always holds a credential envelope.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ModelConfig {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub platform: String,
        pub base_url: String,
        #[serde(default)]
        pub api_key: String,
        #[serde(default)]
        pub is_multimodal: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub modalities: Option<Modalities>,
        #[serde(default)]
        pub is_default: bool,
        #[serde(default)]
        pub thinking_style: ThinkingStyle,
    }

    /// Input for registering a new model. `api_key` is plaintext here.
    #[derive(Debug, Clone, Default)]
    pub struct ModelDraft {
        pub name: String,
        pub platform: String,
        pub base_url: String,
        pub api_key: String,
        pub is_multimodal: bool,
        pub modalities: Option<Modalities>,
        pub is_default: bool,
        pub thinking_style: ThinkingStyle,
    }

    /// Partial update for an existing model. A present `api_key` that differs from
    /// the stored envelope is treated as a new plaintext key.
    #[derive(Debug, Clone, Default)]
    pub struct ModelPatch {
        pub name: Option<String>,
        pub platform: Option<String>,
        pub base_url: Option<String>,
        pub api_key: Option<String>,
        pub is_multimodal: Option<bool>,
        pub modalities: Option<Modalities>,
        pub thinking_style: Option<ThinkingStyle>,
    }

    /// Persisted settings. The flat `api_key`/`base_url`/`model`/`is_multimodal`
    /// fields mirror the current model for older readers.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Settings {
        pub models: Vec<ModelConfig>,
        pub current_model_id: Option<String>,
        pub enable_deep_thinking: bool,

        pub api_key: String,
        pub base_url: String,
        pub model: String,
        pub is_multimodal: bool,
    }

    impl Settings {
        pub fn current_model(&self) -> Option<&ModelConfig> {
            let id = self.current_model_id.as_deref()?;
            self.models.iter().find(|m| m.id == id)
        }

        /// Copy the current model into the flat legacy fields.
        pub fn mirror_current(&mut self) {
            if let Some(model) = self.current_model().cloned() {
                self.api_key = model.api_key;
                self.base_url = model.base_url;
                self.model = model.name;
                self.is_multimodal = model.is_multimodal;
            }
        }
    }
}

pub mod agent_api {
    use serde::{Deserialize, Serialize};

    use crate::session::Role;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ImageUrl {
        pub url: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum ContentPart {
        Text { text: String },
        ImageUrl { image_url: ImageUrl },
    }

    /// Plain string for text-only turns, a part list for multimodal ones.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum MessageContent {
        Text(String),
        Parts(Vec<ContentPart>),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ChatMessage {
        pub role: Role,
        pub content: MessageContent,
    }

    impl ChatMessage {
        pub fn text(role: Role, content: impl Into<String>) -> Self {
            Self {
                role,
                content: MessageContent::Text(content.into()),
            }
        }
    }

    /// One incremental piece of model output, as relayed by the host bridge.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StreamDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reasoning_content: Option<String>,
        #[serde(default)]
        pub done: bool,
    }

    impl StreamDelta {
        pub fn content(text: impl Into<String>) -> Self {
            Self {
                content: Some(text.into()),
                ..Self::default()
            }
        }

        pub fn reasoning(text: impl Into<String>) -> Self {
            Self {
                reasoning_content: Some(text.into()),
                ..Self::default()
            }
        }

        pub fn done() -> Self {
            Self {
                done: true,
                ..Self::default()
            }
        }

        /// True when the delta carries no text and is not a terminator.
        pub fn is_empty(&self) -> bool {
            !self.done
                && self.content.as_deref().map_or(true, str::is_empty)
                && self.reasoning_content.as_deref().map_or(true, str::is_empty)
        }
    }

    /// Accumulated output so far. Consumers replace, never append.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StreamSnapshot {
        pub content: Option<String>,
        pub thinking_content: Option<String>,
    }
}
