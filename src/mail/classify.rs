//! Content classification: every MIME leaf part becomes exactly one
//! inline content item or one named attachment.

use mail_parser::{MessagePart, MimeHeaders};
use serde::{Deserialize, Serialize};

use crate::error::MimeError;

/// Kind of a classified part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    Html,
    Other,
}

impl PartKind {
    /// Map a lowercase `type/subtype` media type.
    pub fn from_media_type(media_type: &str) -> Self {
        match media_type {
            "text/plain" => Self::Text,
            "text/html" => Self::Html,
            _ => Self::Other,
        }
    }
}

/// Inline body content.
///
/// Text and HTML parts carry their decoded text; opaque parts carry their
/// decoded bytes untouched and leave `text` empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailContent {
    pub kind: PartKind,
    /// Decoded payload length in bytes.
    pub len: usize,
    pub text: String,
    pub bytes: Vec<u8>,
}

impl MailContent {
    pub fn text(kind: PartKind, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind,
            len: text.len(),
            text,
            bytes: Vec::new(),
        }
    }

    pub fn opaque(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        Self {
            kind: PartKind::Other,
            len: bytes.len(),
            text: String::new(),
            bytes,
        }
    }
}

/// Named attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttach {
    pub kind: PartKind,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub size: usize,
}

/// Outcome of classifying one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedPart {
    Content(MailContent),
    Attach(MailAttach),
}

/// Lowercase `type/subtype` of a part, defaulting to `text/plain`.
pub fn media_type(part: &MessagePart<'_>) -> String {
    match MimeHeaders::content_type(part) {
        Some(ct) => match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub).to_ascii_lowercase(),
            None => ct.ctype().to_ascii_lowercase(),
        },
        None => "text/plain".to_string(),
    }
}

/// Whether the part is an attachment rather than inline body content.
///
/// A part is inline when its disposition says `inline`, or when it has no
/// `attachment` disposition and a `text/*` media type. Everything else,
/// including undispositioned binary parts, is an attachment.
pub fn is_attachment(part: &MessagePart<'_>) -> bool {
    match MimeHeaders::content_disposition(part).map(|d| d.ctype().to_ascii_lowercase()) {
        Some(disposition) if disposition == "inline" => false,
        Some(disposition) if disposition == "attachment" => true,
        _ => !media_type(part).starts_with("text/"),
    }
}

/// Classify one leaf part. `index` is only used for error reporting and
/// for naming attachments that carry no filename.
pub fn classify_part(index: usize, part: &MessagePart<'_>) -> Result<ClassifiedPart, MimeError> {
    if part.is_encoding_problem {
        return Err(MimeError::UnreadablePart {
            index,
            reason: "body could not be decoded".into(),
        });
    }

    let kind = PartKind::from_media_type(&media_type(part));

    if is_attachment(part) {
        let filename = MimeHeaders::attachment_name(part)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("attachment-{index}"));
        let bytes = part.contents().to_vec();
        return Ok(ClassifiedPart::Attach(MailAttach {
            kind,
            filename,
            size: bytes.len(),
            bytes,
        }));
    }

    let content = match kind {
        PartKind::Text | PartKind::Html => match part.text_contents() {
            Some(text) => MailContent::text(kind, text),
            None => MailContent::text(kind, String::from_utf8_lossy(part.contents())),
        },
        PartKind::Other => MailContent::opaque(part.contents()),
    };
    Ok(ClassifiedPart::Content(content))
}
