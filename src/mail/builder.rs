//! Mail model: envelope metadata plus classified body parts.

use chrono::{DateTime, Utc};

use crate::error::MimeError;
use crate::mail::classify::{ClassifiedPart, MailAttach, MailContent, classify_part};
use crate::mail::fetch::{FetchedMessage, MailAddress};
use crate::mail::mime::{MimeParts, parse_document, reconstruct};

/// One received mail, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub id: String,
    pub seq_num: u32,
    pub from: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    /// Receive time.
    pub date: DateTime<Utc>,
    pub subject: String,
    pub contents: Vec<MailContent>,
    pub attaches: Vec<MailAttach>,
}

impl Mail {
    /// Assemble a mail from a fetch envelope and already classified parts.
    pub fn assemble(
        fetched: &FetchedMessage,
        contents: Vec<MailContent>,
        attaches: Vec<MailAttach>,
    ) -> Self {
        let envelope = &fetched.envelope;
        Self {
            id: envelope.message_id.clone(),
            seq_num: fetched.seq_num,
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            date: fetched
                .internal_date
                .or(envelope.date)
                .unwrap_or_else(Utc::now),
            subject: envelope.subject.clone(),
            contents,
            attaches,
        }
    }

    /// First `From` address.
    pub fn sender(&self) -> Option<&MailAddress> {
        self.from.first()
    }
}

/// Reconstruct, classify and assemble a fetched message.
pub fn build_mail(fetched: &FetchedMessage) -> Result<Mail, MimeError> {
    let (contents, attaches) = read_body(fetched)?;
    Ok(Mail::assemble(fetched, contents, attaches))
}

/// Classify every leaf part of the fetched body.
pub fn read_body(
    fetched: &FetchedMessage,
) -> Result<(Vec<MailContent>, Vec<MailAttach>), MimeError> {
    let mut contents = Vec::new();
    let mut attaches = Vec::new();

    let Some(document) = reconstruct(fetched)? else {
        return Ok((contents, attaches));
    };
    let message = parse_document(&document)?;

    for (index, part) in MimeParts::new(&message) {
        match classify_part(index, part)? {
            ClassifiedPart::Content(content) => contents.push(content),
            ClassifiedPart::Attach(attach) => attaches.push(attach),
        }
    }

    Ok((contents, attaches))
}
