//! Model registry and chat preferences.
//!
//! Keys are sealed by the [`CredentialVault`] before they reach state and are
//! only opened in [`SettingsStore::resolve_current`], right before dispatch.

use parking_lot::RwLock;
use shared::events::SettingsEvent;
use shared::settings::{ModelConfig, ModelDraft, ModelPatch, Settings};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::storage::{self, KeyValueStore, MemoryStore, StorageError};
use crate::vault::{self, CredentialVault, VaultError};

pub const SETTINGS_KEY: &str = "settings";
pub const SETTINGS_VERSION: u32 = 1;
const EVENT_CAPACITY: usize = 32;
const MIGRATED_PLATFORM: &str = "custom";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no model is configured")]
    NoCurrentModel,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Everything needed to dispatch one request to the current model.
pub struct ResolvedModel {
    pub model: ModelConfig,
    pub api_key: Zeroizing<String>,
    pub enable_deep_thinking: bool,
}

struct Inner {
    state: RwLock<Settings>,
    storage: Arc<dyn KeyValueStore>,
    vault: CredentialVault,
    events: broadcast::Sender<SettingsEvent>,
}

#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<Inner>,
}

impl SettingsStore {
    pub fn load(
        storage: Arc<dyn KeyValueStore>,
        vault: CredentialVault,
    ) -> Result<Self, StorageError> {
        let mut settings: Settings = storage::load_versioned(
            storage.as_ref(),
            SETTINGS_KEY,
            SETTINGS_VERSION,
            |state, _| state,
        )?;
        if migrate_settings(&mut settings, &vault) {
            info!(models = settings.models.len(), "settings migrated to model registry");
            storage::save_versioned(storage.as_ref(), SETTINGS_KEY, SETTINGS_VERSION, &settings)?;
        }
        Ok(Self::with_state(settings, storage, vault))
    }

    pub fn in_memory(vault: CredentialVault) -> Self {
        Self::with_state(Settings::default(), Arc::new(MemoryStore::new()), vault)
    }

    fn with_state(
        settings: Settings,
        storage: Arc<dyn KeyValueStore>,
        vault: CredentialVault,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(settings),
                storage,
                vault,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsEvent> {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> Settings {
        self.inner.state.read().clone()
    }

    /// Configured models with keys masked for display.
    pub fn models(&self) -> Vec<ModelConfig> {
        self.inner
            .state
            .read()
            .models
            .iter()
            .cloned()
            .map(|mut m| {
                m.api_key = vault::mask(&m.api_key);
                m
            })
            .collect()
    }

    pub fn model(&self, id: &str) -> Option<ModelConfig> {
        self.inner.state.read().models.iter().find(|m| m.id == id).cloned()
    }

    pub fn current_model(&self) -> Option<ModelConfig> {
        self.inner.state.read().current_model().cloned()
    }

    pub fn enable_deep_thinking(&self) -> bool {
        self.inner.state.read().enable_deep_thinking
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Settings) -> Option<(R, Vec<SettingsEvent>)>,
    ) -> Option<R> {
        let (result, events) = {
            let mut state = self.inner.state.write();
            let outcome = f(&mut state)?;
            if let Err(e) = storage::save_versioned(
                self.inner.storage.as_ref(),
                SETTINGS_KEY,
                SETTINGS_VERSION,
                &*state,
            ) {
                warn!(error = %e, "failed to persist settings");
            }
            outcome
        };
        for event in events {
            let _ = self.inner.events.send(event);
        }
        Some(result)
    }

    /// Register a model and make it current. The draft key is sealed first.
    pub fn add_model(&self, draft: ModelDraft) -> ModelConfig {
        let api_key = if draft.api_key.is_empty() {
            String::new()
        } else {
            self.inner.vault.encrypt(&draft.api_key)
        };
        let model = ModelConfig {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            platform: draft.platform,
            base_url: draft.base_url,
            api_key,
            is_multimodal: draft.is_multimodal,
            modalities: draft.modalities,
            is_default: draft.is_default,
            thinking_style: draft.thinking_style,
        };
        debug!(model = %model.name, key = %vault::mask(&model.api_key), "adding model");
        let added = model.clone();
        self.mutate(|state| {
            let id = model.id.clone();
            state.models.push(model);
            state.current_model_id = Some(id.clone());
            state.mirror_current();
            Some((
                (),
                vec![
                    SettingsEvent::ModelAdded {
                        model_id: id.clone(),
                    },
                    SettingsEvent::CurrentModelChanged { model_id: Some(id) },
                ],
            ))
        });
        added
    }

    /// Merge `patch` into a model.
    ///
    /// A patch key that differs from the stored envelope is a new plaintext
    /// key; it is sealed before anything is committed.
    pub fn update_model(&self, id: &str, patch: ModelPatch) -> Result<ModelConfig, SettingsError> {
        let stored = self
            .model(id)
            .ok_or_else(|| SettingsError::UnknownModel(id.to_string()))?;
        let new_key = match patch.api_key.as_deref() {
            Some(key) if key != stored.api_key => Some(if key.is_empty() {
                String::new()
            } else {
                self.inner.vault.encrypt(key)
            }),
            _ => None,
        };

        self.mutate(|state| {
            let is_current = state.current_model_id.as_deref() == Some(id);
            let model = state.models.iter_mut().find(|m| m.id == id)?;
            if let Some(name) = patch.name {
                model.name = name;
            }
            if let Some(platform) = patch.platform {
                model.platform = platform;
            }
            if let Some(base_url) = patch.base_url {
                model.base_url = base_url;
            }
            if let Some(key) = new_key {
                model.api_key = key;
            }
            if let Some(multimodal) = patch.is_multimodal {
                model.is_multimodal = multimodal;
            }
            if let Some(modalities) = patch.modalities {
                model.modalities = Some(modalities);
            }
            if let Some(style) = patch.thinking_style {
                model.thinking_style = style;
            }
            let updated = model.clone();
            if is_current {
                state.mirror_current();
            }
            Some((
                updated,
                vec![SettingsEvent::ModelUpdated {
                    model_id: id.to_string(),
                }],
            ))
        })
        // Deleted between the read above and the write.
        .ok_or_else(|| SettingsError::UnknownModel(id.to_string()))
    }

    /// Remove a model. A deleted current model hands over to the first
    /// remaining one. Protecting the default model is left to the caller.
    pub fn delete_model(&self, id: &str) -> bool {
        self.mutate(|state| {
            let pos = state.models.iter().position(|m| m.id == id)?;
            state.models.remove(pos);
            let mut events = vec![SettingsEvent::ModelDeleted {
                model_id: id.to_string(),
            }];
            if state.current_model_id.as_deref() == Some(id) {
                state.current_model_id = state.models.first().map(|m| m.id.clone());
                state.mirror_current();
                events.push(SettingsEvent::CurrentModelChanged {
                    model_id: state.current_model_id.clone(),
                });
            }
            Some(((), events))
        })
        .is_some()
    }

    /// Select the current model. Unknown ids are ignored.
    pub fn set_current_model(&self, id: &str) -> bool {
        self.mutate(|state| {
            if !state.models.iter().any(|m| m.id == id) {
                return None;
            }
            state.current_model_id = Some(id.to_string());
            state.mirror_current();
            Some((
                (),
                vec![SettingsEvent::CurrentModelChanged {
                    model_id: Some(id.to_string()),
                }],
            ))
        })
        .is_some()
    }

    pub fn set_deep_thinking(&self, enabled: bool) {
        self.mutate(|state| {
            if state.enable_deep_thinking == enabled {
                return None;
            }
            state.enable_deep_thinking = enabled;
            Some(((), vec![SettingsEvent::DeepThinkingToggled { enabled }]))
        });
    }

    /// Plaintext key of the current model. Legacy plaintext values pass through.
    pub fn decrypted_api_key(&self) -> Result<Zeroizing<String>, SettingsError> {
        let model = self.current_model().ok_or(SettingsError::NoCurrentModel)?;
        self.open_key(&model)
    }

    fn open_key(&self, model: &ModelConfig) -> Result<Zeroizing<String>, SettingsError> {
        self.inner
            .vault
            .reveal(&model.api_key)
            .map(Zeroizing::new)
            .map_err(|e| {
                warn!(model = %model.name, error = %e, "stored API key could not be opened");
                SettingsError::Vault(e)
            })
    }

    /// Current model, its opened key and the deep-thinking switch.
    /// Runs the key derivation, so call it off the async executor.
    pub fn resolve_current(&self) -> Result<ResolvedModel, SettingsError> {
        let (model, enable_deep_thinking) = {
            let state = self.inner.state.read();
            let model = state
                .current_model()
                .cloned()
                .ok_or(SettingsError::NoCurrentModel)?;
            (model, state.enable_deep_thinking)
        };
        let api_key = self.open_key(&model)?;
        Ok(ResolvedModel {
            model,
            api_key,
            enable_deep_thinking,
        })
    }
}

/// Bring settings into the model-registry shape. Returns whether anything changed.
///
/// Legacy state with only the flat fields gets one default model built from
/// them. Plaintext keys are sealed. Running this on its own output changes
/// nothing.
pub fn migrate_settings(settings: &mut Settings, vault: &CredentialVault) -> bool {
    let mut changed = false;

    let has_legacy_fields =
        !(settings.base_url.is_empty() && settings.model.is_empty() && settings.api_key.is_empty());
    if settings.models.is_empty() && has_legacy_fields {
        settings.models.push(ModelConfig {
            id: Uuid::new_v4().to_string(),
            name: settings.model.clone(),
            platform: MIGRATED_PLATFORM.to_string(),
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            is_multimodal: settings.is_multimodal,
            modalities: None,
            is_default: true,
            thinking_style: Default::default(),
        });
        changed = true;
    }

    for model in &mut settings.models {
        if !model.api_key.is_empty() && !vault::is_encrypted(&model.api_key) {
            model.api_key = vault.encrypt(&model.api_key);
            changed = true;
        }
    }

    if settings.current_model().is_none() {
        if let Some(first) = settings.models.first() {
            settings.current_model_id = Some(first.id.clone());
            changed = true;
        }
    }

    if changed || (!settings.api_key.is_empty() && !vault::is_encrypted(&settings.api_key)) {
        settings.mirror_current();
        changed = true;
    }
    changed
}
