//! Content items: the single exchange format between the gateway and
//! the request handler.

use serde::{Deserialize, Serialize};

/// Role a content item plays in a request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tag {
    /// Heading of a reply.
    Title,
    /// Regular body text or data.
    Body,
    /// User-facing error message.
    Error,
    /// Command parsed from the subject line.
    Command,
}

/// Payload kind of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Html,
    Markdown,
    Bytes,
    File,
}

/// One classified unit of request or reply content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { tag: Tag, text: String },
    Html { tag: Tag, html: String },
    Markdown { tag: Tag, markdown: String },
    Bytes { tag: Tag, bytes: Vec<u8> },
    /// A named file; the wrapped item holds its classified payload.
    File { filename: String, content: Box<Content> },
}

/// Ordered sequence of content items.
pub type Contents = Vec<Content>;

impl Content {
    pub fn text(tag: Tag, text: impl Into<String>) -> Self {
        Self::Text { tag, text: text.into() }
    }

    pub fn html(tag: Tag, html: impl Into<String>) -> Self {
        Self::Html { tag, html: html.into() }
    }

    pub fn markdown(tag: Tag, markdown: impl Into<String>) -> Self {
        Self::Markdown { tag, markdown: markdown.into() }
    }

    pub fn bytes(tag: Tag, bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bytes { tag, bytes: bytes.into() }
    }

    pub fn file(filename: impl Into<String>, content: Content) -> Self {
        Self::File {
            filename: filename.into(),
            content: Box::new(content),
        }
    }

    pub fn kind(&self) -> ContentType {
        match self {
            Self::Text { .. } => ContentType::Text,
            Self::Html { .. } => ContentType::Html,
            Self::Markdown { .. } => ContentType::Markdown,
            Self::Bytes { .. } => ContentType::Bytes,
            Self::File { .. } => ContentType::File,
        }
    }

    /// Tag of the item. Files report the tag of their payload.
    pub fn tag(&self) -> Tag {
        match self {
            Self::Text { tag, .. }
            | Self::Html { tag, .. }
            | Self::Markdown { tag, .. }
            | Self::Bytes { tag, .. } => *tag,
            Self::File { content, .. } => content.tag(),
        }
    }

    /// File extension suited to the payload, including the leading dot.
    pub fn ext_name(&self) -> String {
        match self {
            Self::Text { .. } => ".txt".to_string(),
            Self::Html { .. } => ".html".to_string(),
            Self::Markdown { .. } => ".md".to_string(),
            Self::Bytes { .. } => ".bin".to_string(),
            Self::File { filename, content } => std::path::Path::new(filename)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| format!(".{ext}"))
                .unwrap_or_else(|| content.ext_name()),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text { text, .. } => text.len(),
            Self::Html { html, .. } => html.len(),
            Self::Markdown { markdown, .. } => markdown.len(),
            Self::Bytes { bytes, .. } => bytes.len(),
            Self::File { content, .. } => content.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text { text, .. } => text.as_bytes().to_vec(),
            Self::Html { html, .. } => html.as_bytes().to_vec(),
            Self::Markdown { markdown, .. } => markdown.as_bytes().to_vec(),
            Self::Bytes { bytes, .. } => bytes.clone(),
            Self::File { content, .. } => content.to_bytes(),
        }
    }

    /// Textual payload, if the item carries text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            Self::Html { html, .. } => Some(html),
            Self::Markdown { markdown, .. } => Some(markdown),
            Self::Bytes { .. } => None,
            Self::File { content, .. } => content.as_text(),
        }
    }
}
