//! Inbound mail pipeline: fetch results → MIME reconstruction →
//! classification → `Mail`.

pub mod builder;
pub mod classify;
pub mod fetch;
pub mod mime;

pub use builder::{Mail, build_mail};
pub use classify::{ClassifiedPart, MailAttach, MailContent, PartKind};
pub use fetch::{BodyStructure, Envelope, FetchedMessage, MailAddress};
