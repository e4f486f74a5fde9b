//! Per-mail request building blocks: content assembly and error replies.

use std::any::Any;

use crate::error::Fault;
use crate::mail::{Mail, PartKind};
use crate::models::{Content, Contents, Tag};

/// Request id logged when a task fails before an id was generated.
pub const UNKNOWN_REQUEST_ID: &str = "<UNKNOWN>";

/// How a request task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Sender is not a known user; nothing was sent.
    UnknownSender { address: String },
    /// A reply (normal or error) was handed to the sender.
    Replied { request_id: String },
    /// The reply could not be sent.
    SendFailed { request_id: String },
    /// The task ended before a reply could be built.
    Aborted { request_id: Option<String> },
}

/// Build the handler input: commands, then inline content, then attachments.
pub fn build_contents(commands: Contents, mail: &Mail) -> Contents {
    let mut contents =
        Vec::with_capacity(commands.len() + mail.contents.len() + mail.attaches.len());
    contents.extend(commands);

    for message in &mail.contents {
        contents.push(match message.kind {
            PartKind::Html => Content::html(Tag::Body, message.text.clone()),
            PartKind::Text => Content::text(Tag::Body, message.text.clone()),
            PartKind::Other => Content::bytes(Tag::Body, message.bytes.clone()),
        });
    }

    for attach in &mail.attaches {
        let content = match attach.kind {
            PartKind::Text => {
                Content::text(Tag::Body, String::from_utf8_lossy(&attach.bytes).into_owned())
            }
            PartKind::Html => {
                Content::html(Tag::Body, String::from_utf8_lossy(&attach.bytes).into_owned())
            }
            PartKind::Other => Content::bytes(Tag::Body, attach.bytes.clone()),
        };
        contents.push(Content::file(attach.filename.clone(), content));
    }

    contents
}

/// Two-item reply sent when the handler fails.
pub fn error_reply(fault: &Fault) -> Contents {
    vec![
        Content::text(Tag::Title, "ERROR"),
        Content::text(Tag::Error, fault.user_message()),
    ]
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
