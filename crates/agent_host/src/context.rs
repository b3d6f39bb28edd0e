//! Conversation history to wire messages.

use shared::agent_api::{ChatMessage, ContentPart, ImageUrl, MessageContent};
use shared::{AttachmentKind, FileAttachment, Message, Role};

/// Convert stored history into request messages.
///
/// Empty assistant messages (unfinished or stopped replies) are left out.
/// Document attachments are inlined into the text; images become
/// `image_url` parts only for multimodal models.
pub fn to_chat_messages(history: &[Message], multimodal: bool) -> Vec<ChatMessage> {
    history
        .iter()
        .filter(|m| !(m.role == Role::Assistant && m.content.trim().is_empty()))
        .map(|m| to_chat_message(m, multimodal))
        .collect()
}

fn to_chat_message(message: &Message, multimodal: bool) -> ChatMessage {
    let attachments = message.attachments.as_deref().unwrap_or_default();
    let mut text = message.content.clone();
    for attachment in attachments {
        if let Some(block) = inline_block(attachment) {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&block);
        }
    }

    let images: Vec<&str> = message
        .image_urls
        .iter()
        .flatten()
        .map(String::as_str)
        .chain(
            attachments
                .iter()
                .filter(|a| a.is_image())
                .map(|a| a.content.as_str()),
        )
        .collect();

    if !multimodal || images.is_empty() {
        return ChatMessage::text(message.role, text);
    }
    let mut parts = Vec::with_capacity(images.len() + 1);
    if !text.is_empty() {
        parts.push(ContentPart::Text { text });
    }
    parts.extend(images.into_iter().map(|url| ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: url.to_string(),
        },
    }));
    ChatMessage {
        role: message.role,
        content: MessageContent::Parts(parts),
    }
}

fn inline_block(attachment: &FileAttachment) -> Option<String> {
    match attachment.kind {
        AttachmentKind::Image | AttachmentKind::Error => None,
        // Opaque bytes are no use to the model as text.
        AttachmentKind::File => Some(format!(
            "[File: {}] ({}, {} bytes, content not shown)",
            attachment.name, attachment.mime_type, attachment.size
        )),
        _ => Some(format!(
            "[File: {}]\n```\n{}\n```",
            attachment.name,
            attachment.content.trim_end()
        )),
    }
}
