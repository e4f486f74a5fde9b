//! Subject-line commands.
//!
//! The subject, with reply/forward prefixes removed, is split on `;` and
//! every non-empty segment becomes one leading command item.

use crate::models::{Content, Contents, Tag};

const REPLY_PREFIXES: &[&str] = &["re:", "fwd:", "fw:"];

/// Strip any number of `Re:` / `Fwd:` / `FW:` prefixes.
pub fn normalize_subject(subject: &str) -> &str {
    let mut rest = subject.trim();
    loop {
        let lower = rest.to_ascii_lowercase();
        let Some(prefix) = REPLY_PREFIXES.iter().find(|p| lower.starts_with(*p)) else {
            return rest;
        };
        rest = rest[prefix.len()..].trim_start();
    }
}

/// Parse a subject line into command items.
pub fn parse_command(subject: &str) -> Contents {
    normalize_subject(subject)
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| Content::text(Tag::Command, segment))
        .collect()
}
