//! Change notifications published by the session and settings stores.
//!
//! Subscribers receive ids only and read fresh state from the store.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Created {
        session_id: String,
    },
    Deleted {
        session_id: String,
    },
    Selected {
        session_id: Option<String>,
    },
    MessageAdded {
        session_id: String,
        message_id: String,
    },
    MessageUpdated {
        session_id: String,
        message_id: String,
    },
    MessagesRemoved {
        session_id: String,
        message_ids: Vec<String>,
    },
    TitleChanged {
        session_id: String,
        title: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SessionEvent::Created { session_id }
            | SessionEvent::Deleted { session_id }
            | SessionEvent::MessageAdded { session_id, .. }
            | SessionEvent::MessageUpdated { session_id, .. }
            | SessionEvent::MessagesRemoved { session_id, .. }
            | SessionEvent::TitleChanged { session_id, .. } => Some(session_id),
            SessionEvent::Selected { session_id } => session_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingsEvent {
    ModelAdded { model_id: String },
    ModelUpdated { model_id: String },
    ModelDeleted { model_id: String },
    CurrentModelChanged { model_id: Option<String> },
    DeepThinkingToggled { enabled: bool },
}
