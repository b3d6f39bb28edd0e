//! Conversation types: sessions and the messages they own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attachment::FileAttachment;

/// Number of characters of the first user message used as a session title.
pub const TITLE_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single chat message. Only `content` and `thinking_content` change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<FileAttachment>>,
}

/// A message before the store assigns it an id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub image_urls: Option<Vec<String>>,
    pub thinking_content: Option<String>,
    pub attachments: Option<Vec<FileAttachment>>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image_urls: None,
            thinking_content: None,
            attachments: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<FileAttachment>) -> Self {
        if !attachments.is_empty() {
            self.attachments = Some(attachments);
        }
        self
    }

    pub fn with_image_urls(mut self, urls: Vec<String>) -> Self {
        if !urls.is_empty() {
            self.image_urls = Some(urls);
        }
        self
    }

    pub fn into_message(self, timestamp: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4().to_string(),
            role: self.role,
            content: self.content,
            timestamp,
            image_urls: self.image_urls,
            thinking_content: self.thinking_content,
            attachments: self.attachments,
        }
    }
}

/// A conversation. Messages are kept in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub const DEFAULT_TITLE: &'static str = "New Chat";

    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: Self::DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Leading characters of `content`, used as an automatic title.
    pub fn derive_title(content: &str) -> String {
        let title: String = content.trim().chars().take(TITLE_CHARS).collect();
        if title.trim().is_empty() {
            Self::DEFAULT_TITLE.to_string()
        } else {
            title
        }
    }

    /// Advance `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_takes_leading_chars() {
        assert_eq!(
            Session::derive_title("How do I configure a reverse proxy?"),
            "How do I configure a"
        );
        assert_eq!(Session::derive_title("short"), "short");
        assert_eq!(Session::derive_title("   "), Session::DEFAULT_TITLE);
        // Counts characters, not bytes.
        assert_eq!(Session::derive_title("数据库迁移的最佳实践是什么").chars().count(), 13);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut session = Session::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        session.updated_at = future;
        session.touch();
        assert_eq!(session.updated_at, future);
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let msg = NewMessage::assistant("hi").into_message(Utc::now());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json.get("thinkingContent").is_none());
        assert!(json.get("imageUrls").is_none());
    }
}
