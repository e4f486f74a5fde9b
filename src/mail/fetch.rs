//! Raw fetch results handed from the mailbox listener to the pipeline.
//!
//! A fetch carries the envelope, a description of the body structure and
//! the raw body bytes, mirroring what an IMAP `FETCH` returns. The body is
//! not a ready-to-parse document: its top-level headers live only in the
//! structure description.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MimeError;

/// One mailbox address with its display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddress {
    pub address: String,
    pub name: String,
}

impl MailAddress {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

/// Envelope fields of a fetched message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: String,
    pub from: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
}

/// Top-level body structure description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyStructure {
    MultiPart {
        /// Full media type, e.g. `multipart/mixed`.
        media_type: String,
        /// Declared boundary parameter.
        boundary: Option<String>,
    },
    SinglePart {
        /// Full media type, e.g. `text/plain`.
        media_type: String,
        charset: Option<String>,
        /// Content-Transfer-Encoding, e.g. `base64`.
        encoding: String,
    },
}

/// One message as fetched from the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub seq_num: u32,
    pub envelope: Envelope,
    /// Server-side receive time.
    pub internal_date: Option<DateTime<Utc>>,
    pub body_structure: BodyStructure,
    /// Raw body section; `None` when no body was fetched.
    pub body: Option<Vec<u8>>,
}

impl FetchedMessage {
    /// Split a complete RFC 822 message into envelope, structure and body.
    pub fn from_rfc822(
        seq_num: u32,
        internal_date: Option<DateTime<Utc>>,
        raw: &[u8],
    ) -> Result<Self, MimeError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| MimeError::Unparseable {
                reason: format!("message {seq_num} has no parseable header"),
            })?;

        let envelope = Envelope {
            message_id: parsed
                .message_id()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4())),
            from: read_addresses(parsed.from()),
            to: read_addresses(parsed.to()),
            subject: parsed.subject().unwrap_or_default().to_string(),
            date: parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
        };

        let body_structure = match parsed.parts.first() {
            Some(root) => describe_structure(root),
            None => BodyStructure::SinglePart {
                media_type: "text/plain".into(),
                charset: None,
                encoding: "7bit".into(),
            },
        };

        let (_, body) = split_header_body(raw);

        Ok(Self {
            seq_num,
            envelope,
            internal_date,
            body_structure,
            body: Some(body.to_vec()),
        })
    }
}

fn describe_structure(root: &mail_parser::MessagePart<'_>) -> BodyStructure {
    let content_type = MimeHeaders::content_type(root);
    let ctype = content_type
        .map(|ct| ct.ctype().to_ascii_lowercase())
        .unwrap_or_else(|| "text".into());
    let subtype = content_type
        .and_then(|ct| ct.subtype())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| if ctype == "text" { "plain".into() } else { "octet-stream".into() });

    if ctype == "multipart" {
        return BodyStructure::MultiPart {
            media_type: format!("multipart/{subtype}"),
            boundary: content_type
                .and_then(|ct| ct.attribute("boundary"))
                .map(|b| b.to_string()),
        };
    }

    BodyStructure::SinglePart {
        media_type: format!("{ctype}/{subtype}"),
        charset: content_type
            .and_then(|ct| ct.attribute("charset"))
            .map(|c| c.to_string()),
        encoding: MimeHeaders::content_transfer_encoding(root)
            .map(|e| e.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "7bit".into()),
    }
}

/// Split raw message bytes at the first blank line.
pub fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    let crlf = find(raw, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find(raw, b"\n\n").map(|pos| (pos, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((pos, len)) => (&raw[..pos], &raw[pos + len..]),
        None => (raw, &[]),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Read address/name pairs from an optional parsed address field.
pub fn read_addresses(addr: Option<&mail_parser::Address<'_>>) -> Vec<MailAddress> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let to_pair = |a: &mail_parser::Addr<'_>| {
        a.address.as_ref().map(|address| {
            MailAddress::new(
                address.to_string(),
                a.name.as_ref().map(|n| n.to_string()).unwrap_or_default(),
            )
        })
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs.iter().filter_map(to_pair).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(to_pair))
            .collect(),
    }
}
