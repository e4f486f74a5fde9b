//! Mailbox listener and outbound sender seams.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ChannelError;
use crate::mail::FetchedMessage;
use crate::models::{Contents, User};

/// Polls a mailbox and feeds raw fetch results to the pipeline.
pub trait MailboxListener: Send + Sync {
    /// Start polling every `poll_interval`.
    ///
    /// Each fetched message is sent on `mails`; protocol errors go to
    /// `errors`. Sends are awaited, so a full queue stalls polling.
    fn listen(
        &self,
        mails: mpsc::Sender<FetchedMessage>,
        errors: mpsc::Sender<ChannelError>,
        poll_interval: Duration,
    ) -> ListenerHandle;
}

/// Formats and transmits replies.
#[async_trait]
pub trait MailSender: Send + Sync {
    /// Send `contents` to `reply_to` on behalf of `user`.
    async fn push(&self, user: &User, reply_to: &str, contents: &Contents)
    -> Result<(), ChannelError>;
}

/// Handle to a running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    pub handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl ListenerHandle {
    pub fn new(handle: JoinHandle<()>, shutdown: Arc<AtomicBool>) -> Self {
        Self { handle, shutdown }
    }

    /// Ask the listener to stop after the current poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
