//! Dispatch loop and per-mail request task.
//!
//! The loop drains the listener's mail and error queues. Every mail gets
//! its own spawned task, admitted through a semaphore so at most
//! `max_in_flight` tasks run at once. A task resolves the sender, builds
//! the handler input, calls the handler and pushes the reply. Nothing a
//! task does can stop the loop.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::channels::{ListenerHandle, MailSender, MailboxListener};
use crate::config::{DispatchConfig, ERROR_QUEUE_CAPACITY};
use crate::dispatch::command::parse_command;
use crate::dispatch::request::{
    RequestOutcome, UNKNOWN_REQUEST_ID, build_contents, error_reply, panic_message,
};
use crate::error::{ChannelError, Fault, RequestError, Result};
use crate::handler::MessageHandler;
use crate::mail::{FetchedMessage, build_mail};
use crate::models::{Contents, User};
use crate::store::UserStore;

/// Message shown to the sender when the handler runs past its deadline.
pub const HANDLER_TIMEOUT_MESSAGE: &str = "request timed out";

/// Callback for bulk user list changes. Accepted but never invoked.
pub type BatchUserChangeHandler = Arc<dyn Fn(Vec<User>) + Send + Sync>;

/// Handles to a running gateway.
#[derive(Debug)]
pub struct DispatchHandle {
    pub listener: ListenerHandle,
    pub dispatch: JoinHandle<()>,
}

impl DispatchHandle {
    /// Stop polling. The loop ends once the listener drops its queue.
    pub fn shutdown(&self) {
        self.listener.shutdown();
    }
}

pub struct Dispatcher {
    users: Arc<dyn UserStore>,
    sender: Arc<dyn MailSender>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    config: DispatchConfig,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        users: Arc<dyn UserStore>,
        sender: Arc<dyn MailSender>,
        config: DispatchConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            users,
            sender,
            handler: RwLock::new(None),
            config,
            permits,
        }
    }

    /// Register the request handler, replacing any previous one.
    pub fn on_message_receive(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(handler);
        Ok(())
    }

    /// Bulk user changes are not supported; the callback is dropped.
    pub fn on_batch_user_change(&self, _handler: BatchUserChangeHandler) -> Result<()> {
        Ok(())
    }

    fn current_handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of request tasks that could start right now.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Create the queues, start `listener` and spawn the dispatch loop.
    pub fn listen(
        self: &Arc<Self>,
        listener: &dyn MailboxListener,
        poll_interval: Duration,
        mail_queue_capacity: usize,
    ) -> DispatchHandle {
        let (mail_tx, mail_rx) = mpsc::channel(mail_queue_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);

        let listener = listener.listen(mail_tx, error_tx, poll_interval);
        let dispatch = tokio::spawn(Arc::clone(self).run(mail_rx, error_rx));

        DispatchHandle { listener, dispatch }
    }

    /// Drain both queues until the mail queue closes.
    ///
    /// While the admission cap is reached the loop stops taking mail, which
    /// lets the bounded mail queue fill and stalls the listener. Listener
    /// errors are still drained during that wait.
    pub async fn run(
        self: Arc<Self>,
        mut mails: mpsc::Receiver<FetchedMessage>,
        mut errors: mpsc::Receiver<ChannelError>,
    ) {
        let mut errors_open = true;

        loop {
            tokio::select! {
                err = errors.recv(), if errors_open => {
                    errors_open = log_listener_error(err);
                }
                mail = mails.recv() => {
                    let Some(mail) = mail else {
                        tracing::info!("Mail queue closed, dispatch loop stopping");
                        break;
                    };

                    let permit = loop {
                        tokio::select! {
                            permit = Arc::clone(&self.permits).acquire_owned() => break permit,
                            err = errors.recv(), if errors_open => {
                                errors_open = log_listener_error(err);
                            }
                        }
                    };
                    let Ok(permit) = permit else {
                        tracing::error!("Admission semaphore closed, dispatch loop stopping");
                        break;
                    };

                    let dispatcher = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        dispatcher.process(mail).await;
                    });
                }
            }
        }
    }

    /// Run one request task to completion. Never panics and never fails;
    /// anything that goes wrong is logged here with the best-known id.
    pub async fn process(&self, fetched: FetchedMessage) -> RequestOutcome {
        let seq = fetched.seq_num;
        let request_id = OnceLock::new();

        let result = AssertUnwindSafe(self.run_request(fetched, &request_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(RequestError::Panicked(panic_message(payload.as_ref()))));

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                let id = request_id.get().map(String::as_str).unwrap_or(UNKNOWN_REQUEST_ID);
                tracing::error!(request_id = %id, seq, "Request aborted: {err}");
                RequestOutcome::Aborted {
                    request_id: request_id.get().cloned(),
                }
            }
        }
    }

    async fn run_request(
        &self,
        fetched: FetchedMessage,
        request_id: &OnceLock<String>,
    ) -> std::result::Result<RequestOutcome, RequestError> {
        let address = fetched
            .envelope
            .from
            .first()
            .map(|from| from.address.clone())
            .unwrap_or_default();

        let Some(user) = self.users.find_user(&address) else {
            tracing::warn!(address = %address, seq = fetched.seq_num, "Ignoring mail from unknown sender");
            return Ok(RequestOutcome::UnknownSender { address });
        };

        let id = request_id
            .get_or_init(|| Uuid::new_v4().to_string())
            .clone();
        tracing::info!(request_id = %id, user = %user.name, address = %address, ">>> Request started");

        let mail = build_mail(&fetched)?;
        let contents = build_contents(parse_command(&mail.subject), &mail);

        let reply = match self.call_handler(&user, &id, contents).await {
            Ok(reply) => reply,
            Err(fault) => {
                tracing::error!(
                    request_id = %id,
                    user = %user.name,
                    detail = %fault.log_message(),
                    "Handler failed: {fault}"
                );
                error_reply(&fault)
            }
        };

        let outcome = match timeout(
            self.config.send_timeout,
            self.sender.push(&user, &address, &reply),
        )
        .await
        {
            Ok(Ok(())) => RequestOutcome::Replied {
                request_id: id.clone(),
            },
            Ok(Err(err)) => {
                tracing::error!(request_id = %id, address = %address, error = %err, "Failed to send reply");
                RequestOutcome::SendFailed {
                    request_id: id.clone(),
                }
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %id,
                    address = %address,
                    timeout_secs = self.config.send_timeout.as_secs(),
                    "Reply send timed out"
                );
                RequestOutcome::SendFailed {
                    request_id: id.clone(),
                }
            }
        };

        tracing::info!(request_id = %id, user = %user.name, user_id = %user.id, "<<< Request finished");
        Ok(outcome)
    }

    async fn call_handler(
        &self,
        user: &User,
        request_id: &str,
        contents: Contents,
    ) -> std::result::Result<Contents, Fault> {
        let Some(handler) = self.current_handler() else {
            return Err(Fault::program("no message handler registered"));
        };

        let call = AssertUnwindSafe(handler.handle(&user.id, request_id, user, contents)).catch_unwind();
        match timeout(self.config.handler_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(Fault::program(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(_) => {
                tracing::warn!(
                    request_id,
                    timeout_secs = self.config.handler_timeout.as_secs(),
                    "Handler timed out"
                );
                Err(Fault::normal(HANDLER_TIMEOUT_MESSAGE))
            }
        }
    }
}

/// Log one listener error. Returns whether the error queue is still open.
fn log_listener_error(err: Option<ChannelError>) -> bool {
    match err {
        Some(err) => {
            tracing::error!(error = %err, "Mailbox listener error");
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::handler::handler_fn;
    use crate::models::{Content, Tag};
    use crate::store::StaticUserStore;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, Contents)>>,
    }

    #[async_trait]
    impl MailSender for RecordingSender {
        async fn push(
            &self,
            _user: &User,
            reply_to: &str,
            contents: &Contents,
        ) -> std::result::Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((reply_to.to_string(), contents.clone()));
            Ok(())
        }
    }

    fn dispatcher(sender: Arc<RecordingSender>) -> Dispatcher {
        let users = StaticUserStore::new(vec![User::new("u1", "Alice", "alice@example.com")]);
        Dispatcher::new(Arc::new(users), sender, DispatchConfig::default())
    }

    fn fetched(from: &str, subject: &str) -> FetchedMessage {
        let raw = format!(
            "From: {from}\r\nTo: bot@example.com\r\nSubject: {subject}\r\n\r\nhello\r\n"
        );
        FetchedMessage::from_rfc822(1, None, raw.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn missing_handler_replies_with_server_error() {
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(Arc::clone(&sender));

        let outcome = d.process(fetched("alice@example.com", "status")).await;
        assert!(matches!(outcome, RequestOutcome::Replied { .. }));

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "alice@example.com");
        assert_eq!(sent[0].1[1], Content::text(Tag::Error, "server error"));
    }

    #[tokio::test]
    async fn registering_a_handler_replaces_the_previous_one() {
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(Arc::clone(&sender));

        d.on_message_receive(Arc::new(handler_fn(|_req| async {
            Ok::<_, Fault>(vec![Content::text(Tag::Body, "first")])
        })))
        .unwrap();
        d.on_message_receive(Arc::new(handler_fn(|_req| async {
            Ok::<_, Fault>(vec![Content::text(Tag::Body, "second")])
        })))
        .unwrap();

        d.process(fetched("alice@example.com", "status")).await;
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].1, vec![Content::text(Tag::Body, "second")]);
    }

    #[tokio::test]
    async fn handler_sees_commands_before_body() {
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(Arc::clone(&sender));
        d.on_message_receive(Arc::new(handler_fn(|req| async move { Ok::<_, Fault>(req.contents) })))
            .unwrap();

        d.process(fetched("alice@example.com", "Re: status; weekly")).await;

        let sent = sender.sent.lock().unwrap();
        let reply = &sent[0].1;
        assert_eq!(reply.len(), 3);
        assert_eq!(reply[0], Content::text(Tag::Command, "status"));
        assert_eq!(reply[1], Content::text(Tag::Command, "weekly"));
        assert_eq!(reply[2].tag(), Tag::Body);
        assert!(reply[2].as_text().unwrap().starts_with("hello"));
    }

    #[tokio::test]
    async fn sender_lookup_ignores_case() {
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(Arc::clone(&sender));

        let outcome = d.process(fetched("ALICE@Example.com", "status")).await;
        assert!(matches!(outcome, RequestOutcome::Replied { .. }));
    }

    #[test]
    fn batch_user_change_is_accepted_and_ignored() {
        let d = dispatcher(Arc::new(RecordingSender::default()));
        assert!(d.on_batch_user_change(Arc::new(|_users| {})).is_ok());
    }

    #[test]
    fn admission_cap_is_at_least_one() {
        let users = StaticUserStore::new(vec![]);
        let config = DispatchConfig {
            max_in_flight: 0,
            ..DispatchConfig::default()
        };
        let d = Dispatcher::new(Arc::new(users), Arc::new(RecordingSender::default()), config);
        assert_eq!(d.available_slots(), 1);
    }
}
