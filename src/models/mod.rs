//! Shared data model.

pub mod content;
pub mod user;

pub use content::{Content, ContentType, Contents, Tag};
pub use user::User;
