use serde::{Deserialize, Serialize};

/// Attachment classes produced by file ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Text,
    Pdf,
    Word,
    Excel,
    Powerpoint,
    /// Opaque binary, carried as a base64 data URL.
    File,
    /// Ingestion failed; `content` holds the error message.
    Error,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Text => "text",
            AttachmentKind::Pdf => "pdf",
            AttachmentKind::Word => "word",
            AttachmentKind::Excel => "excel",
            AttachmentKind::Powerpoint => "powerpoint",
            AttachmentKind::File => "file",
            AttachmentKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub size: u64,
    /// Data URL for images and opaque files, extracted text otherwise.
    pub content: String,
    pub mime_type: String,
}

impl FileAttachment {
    pub fn error(
        name: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AttachmentKind::Error,
            size,
            content: message.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == AttachmentKind::Image
    }
}
