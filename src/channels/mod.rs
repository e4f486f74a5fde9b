//! Mailbox I/O: the IMAP listener feeding the pipeline and the SMTP
//! sender delivering replies.

pub mod channel;
pub mod imap;
pub mod smtp;

pub use channel::*;
pub use imap::ImapListener;
pub use smtp::SmtpSender;
