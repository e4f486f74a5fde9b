//! MIME reconstruction: rebuilds a parseable document from a fetch that
//! only carries a structure description plus raw body bytes.
//!
//! Multipart bodies get a synthesized header declaring a fixed boundary
//! marker, and every literal occurrence of the sender's boundary in the
//! body is rewritten to that marker. Only the top-level boundary is
//! touched; nested multiparts keep their own boundaries.

use std::borrow::Cow;

use mail_parser::{Message, MessageParser, MessagePart, PartType};
use regex::bytes::{NoExpand, Regex};

use crate::error::MimeError;
use crate::mail::fetch::{BodyStructure, FetchedMessage};

/// Boundary every reconstructed multipart document uses.
pub const NORMALIZED_BOUNDARY: &str = "GATEWAYPARTBOUNDARY";

/// Rebuild a complete MIME document from a fetch.
///
/// Returns `Ok(None)` when the fetch carries no body section.
pub fn reconstruct(fetched: &FetchedMessage) -> Result<Option<Vec<u8>>, MimeError> {
    let Some(body) = fetched.body.as_deref() else {
        return Ok(None);
    };

    let document = match &fetched.body_structure {
        BodyStructure::MultiPart {
            media_type,
            boundary,
        } => {
            let boundary = boundary
                .as_deref()
                .filter(|b| !b.is_empty())
                .ok_or(MimeError::MissingBoundary)?;

            // A boundary that is already part of the marker cannot be
            // rewritten without touching the marker itself.
            let (declared, body) = if NORMALIZED_BOUNDARY.contains(boundary) {
                (boundary, Cow::Borrowed(body))
            } else {
                (NORMALIZED_BOUNDARY, normalize_boundary(body, boundary)?)
            };

            let mut doc = format!(
                "Mime-Version: 1.0\r\nContent-Type: {}; boundary=\"{}\"\r\n\r\n",
                media_type.trim(),
                declared
            )
            .into_bytes();
            doc.extend_from_slice(&body);
            doc
        }
        BodyStructure::SinglePart {
            media_type,
            charset,
            encoding,
        } => {
            let content_type = match charset {
                Some(charset) => format!("{}; charset=\"{}\"", media_type.trim(), charset),
                None => media_type.trim().to_string(),
            };
            let mut doc = format!(
                "Content-Type: {content_type}\r\nContent-Transfer-Encoding: {encoding}\r\n\r\n"
            )
            .into_bytes();
            doc.extend_from_slice(body);
            doc
        }
    };

    Ok(Some(document))
}

/// Rewrite every literal occurrence of `boundary` to the fixed marker.
///
/// Occurrences unrelated to part delimiters are rewritten too.
pub fn normalize_boundary<'a>(body: &'a [u8], boundary: &str) -> Result<Cow<'a, [u8]>, MimeError> {
    let pattern = Regex::new(&regex::escape(boundary)).map_err(|e| MimeError::Unparseable {
        reason: format!("boundary pattern: {e}"),
    })?;
    Ok(pattern.replace_all(body, NoExpand(NORMALIZED_BOUNDARY.as_bytes())))
}

/// Parse a reconstructed document.
pub fn parse_document(document: &[u8]) -> Result<Message<'_>, MimeError> {
    MessageParser::default()
        .parse(document)
        .ok_or_else(|| MimeError::Unparseable {
            reason: "parser produced no message".into(),
        })
}

/// Iterator over the leaf parts of a parsed document.
///
/// Multipart containers are skipped; their children appear in document order.
pub struct MimeParts<'a, 'x> {
    inner: std::iter::Enumerate<std::slice::Iter<'a, MessagePart<'x>>>,
}

impl<'a, 'x> MimeParts<'a, 'x> {
    pub fn new(message: &'a Message<'x>) -> Self {
        Self {
            inner: message.parts.iter().enumerate(),
        }
    }
}

impl<'a, 'x> Iterator for MimeParts<'a, 'x> {
    /// Part index within the document and the part itself.
    type Item = (usize, &'a MessagePart<'x>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .by_ref()
            .find(|(_, part)| !matches!(part.body, PartType::Multipart(_)))
    }
}
