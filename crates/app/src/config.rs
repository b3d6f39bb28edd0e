//! Startup configuration from the environment.

use services::{JsonFileStore, SettingsStore};
use shared::settings::{ModelDraft, ThinkingStyle};
use std::path::PathBuf;
use tracing::info;

pub const BASE_URL_ENV: &str = "DESKCHAT_BASE_URL";
pub const MODEL_ENV: &str = "DESKCHAT_MODEL";
pub const API_KEY_ENV: &str = "DESKCHAT_API_KEY";
pub const MULTIMODAL_ENV: &str = "DESKCHAT_MULTIMODAL";
pub const THINKING_STYLE_ENV: &str = "DESKCHAT_THINKING_STYLE";

pub fn data_dir() -> PathBuf {
    JsonFileStore::default_dir()
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn parse_thinking_style(value: &str) -> Option<ThinkingStyle> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "reasoning_effort" => Some(ThinkingStyle::ReasoningEffort),
        "thinking_object" | "thinking" => Some(ThinkingStyle::ThinkingObject),
        "none" | "off" => Some(ThinkingStyle::None),
        _ => None,
    }
}

/// Model described by the environment, if base URL and model name are both set.
pub fn model_from_env(lookup: impl Fn(&str) -> Option<String>) -> Option<ModelDraft> {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let base_url = get(BASE_URL_ENV)?;
    let name = get(MODEL_ENV)?;
    Some(ModelDraft {
        name,
        platform: "env".to_string(),
        base_url,
        api_key: get(API_KEY_ENV).unwrap_or_default(),
        is_multimodal: get(MULTIMODAL_ENV).is_some_and(|v| truthy(&v)),
        modalities: None,
        is_default: true,
        thinking_style: get(THINKING_STYLE_ENV)
            .and_then(|v| parse_thinking_style(&v))
            .unwrap_or_default(),
    })
}

/// First run: register the environment's model when none is configured.
pub fn bootstrap_model(
    settings: &SettingsStore,
    lookup: impl Fn(&str) -> Option<String>,
) -> bool {
    if !settings.models().is_empty() {
        return false;
    }
    let Some(draft) = model_from_env(lookup) else {
        return false;
    };
    info!(model = %draft.name, base_url = %draft.base_url, "registering model from environment");
    settings.add_model(draft);
    true
}
