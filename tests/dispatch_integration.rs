//! Integration tests for the dispatch loop and request tasks.
//!
//! Each test wires a `Dispatcher` to stub user stores, handlers and
//! senders, feeds it fetched mails through real queues, and observes the
//! replies that come out the other end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use mail_gateway::channels::{ListenerHandle, MailSender, MailboxListener};
use mail_gateway::config::DispatchConfig;
use mail_gateway::dispatch::{Dispatcher, RequestOutcome};
use mail_gateway::error::{ChannelError, Fault};
use mail_gateway::handler::{HandlerRequest, MessageHandler, handler_fn};
use mail_gateway::mail::FetchedMessage;
use mail_gateway::models::{Content, Contents, Tag, User};
use mail_gateway::store::{StaticUserStore, UserStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Stubs ──────────────────────────────────────────────────────────────

/// Sender that forwards every reply to a channel the test can await.
struct ChannelSender {
    tx: mpsc::UnboundedSender<(String, Contents)>,
}

#[async_trait]
impl MailSender for ChannelSender {
    async fn push(
        &self,
        _user: &User,
        reply_to: &str,
        contents: &Contents,
    ) -> Result<(), ChannelError> {
        let _ = self.tx.send((reply_to.to_string(), contents.clone()));
        Ok(())
    }
}

/// Sender that always fails.
struct FailingSender;

#[async_trait]
impl MailSender for FailingSender {
    async fn push(
        &self,
        _user: &User,
        _reply_to: &str,
        _contents: &Contents,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::SendFailed {
            name: "stub".into(),
            reason: "relay refused".into(),
        })
    }
}

/// Listener that delivers a fixed batch of mails and one error, then closes.
struct BatchListener {
    mails: Mutex<Vec<FetchedMessage>>,
}

impl MailboxListener for BatchListener {
    fn listen(
        &self,
        mails: mpsc::Sender<FetchedMessage>,
        errors: mpsc::Sender<ChannelError>,
        _poll_interval: Duration,
    ) -> ListenerHandle {
        let batch = std::mem::take(&mut *self.mails.lock().unwrap());
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle = tokio::spawn(async move {
            let _ = errors
                .send(ChannelError::Disconnected {
                    name: "stub".into(),
                    reason: "connection reset".into(),
                })
                .await;
            for mail in batch {
                if mails.send(mail).await.is_err() {
                    break;
                }
            }
        });
        ListenerHandle::new(handle, shutdown)
    }
}

/// Counts WARN events seen while installed as the default subscriber.
#[derive(Clone, Default)]
struct WarnCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Records the `request_id` field of every ERROR event.
#[derive(Clone, Default)]
struct ErrorIds(Arc<Mutex<Vec<String>>>);

struct RequestIdVisitor(Option<String>);

impl tracing::field::Visit for RequestIdVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for ErrorIds {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            let mut visitor = RequestIdVisitor(None);
            event.record(&mut visitor);
            if let Some(id) = visitor.0 {
                self.0.lock().unwrap().push(id);
            }
        }
    }
}

/// User store that panics on one address and delegates the rest.
struct PanickingStore {
    poisoned: &'static str,
    inner: Arc<StaticUserStore>,
}

impl UserStore for PanickingStore {
    fn find_user(&self, email: &str) -> Option<User> {
        if email == self.poisoned {
            panic!("user index corrupted");
        }
        self.inner.find_user(email)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

fn users() -> Arc<StaticUserStore> {
    Arc::new(StaticUserStore::new(vec![
        User::new("u-alice", "Alice", "alice@example.com"),
        User::new("u-bob", "Bob", "bob@example.com"),
    ]))
}

fn mail(seq: u32, from: &str, subject: &str, body: &str) -> FetchedMessage {
    let raw = format!(
        "From: {from}\r\nTo: bot@example.com\r\nSubject: {subject}\r\n\
         Content-Type: text/plain\r\n\r\n{body}\r\n"
    );
    FetchedMessage::from_rfc822(seq, None, raw.as_bytes()).unwrap()
}

fn gateway(
    config: DispatchConfig,
    handler: impl MessageHandler + 'static,
) -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<(String, Contents)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(
        users(),
        Arc::new(ChannelSender { tx }),
        config,
    ));
    dispatcher.on_message_receive(Arc::new(handler)).unwrap();
    (dispatcher, rx)
}

/// Start the run loop on fresh queues and return their senders.
fn start(
    dispatcher: &Arc<Dispatcher>,
) -> (mpsc::Sender<FetchedMessage>, mpsc::Sender<ChannelError>) {
    let (mail_tx, mail_rx) = mpsc::channel(20);
    let (error_tx, error_rx) = mpsc::channel(1);
    tokio::spawn(Arc::clone(dispatcher).run(mail_rx, error_rx));
    (mail_tx, error_tx)
}

async fn next_reply(rx: &mut mpsc::UnboundedReceiver<(String, Contents)>) -> (String, Contents) {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("sender dropped")
}

fn echo(req: HandlerRequest) -> Result<Contents, Fault> {
    Ok(vec![Content::text(
        Tag::Body,
        format!("{}:{}", req.user.name, req.request_id),
    )])
}

// ── Request task ───────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_sender_gets_no_reply_and_one_warning() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { echo(req) }
        }),
    );

    let warnings = WarnCounter::default();
    let subscriber = tracing_subscriber::registry().with(warnings.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let outcome = dispatcher
        .process(mail(1, "mallory@example.com", "status", "hi"))
        .await;

    assert_eq!(
        outcome,
        RequestOutcome::UnknownSender {
            address: "mallory@example.com".into()
        }
    );
    assert_eq!(warnings.0.load(Ordering::SeqCst), 1);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn normal_fault_becomes_two_item_error_reply() {
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(|_req| async { Err::<Contents, _>(Fault::normal("Invalid command")) }),
    );

    dispatcher
        .process(mail(1, "alice@example.com", "bogus", "hi"))
        .await;

    let (to, reply) = next_reply(&mut rx).await;
    assert_eq!(to, "alice@example.com");
    assert_eq!(
        reply,
        vec![
            Content::text(Tag::Title, "ERROR"),
            Content::text(Tag::Error, "Invalid command"),
        ]
    );
}

#[tokio::test]
async fn internal_fault_hides_detail_from_sender() {
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(|_req| async {
            Err::<Contents, _>(Fault::from(anyhow::anyhow!("database password rejected")))
        }),
    );

    dispatcher
        .process(mail(1, "alice@example.com", "status", "hi"))
        .await;

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(reply[1], Content::text(Tag::Error, "server error"));
}

#[tokio::test]
async fn handler_timeout_produces_error_reply() {
    let config = DispatchConfig {
        handler_timeout: Duration::from_millis(50),
        ..DispatchConfig::default()
    };
    let (dispatcher, mut rx) = gateway(
        config,
        handler_fn(|_req| async {
            std::future::pending::<()>().await;
            Ok::<Contents, Fault>(vec![])
        }),
    );

    dispatcher
        .process(mail(1, "alice@example.com", "status", "hi"))
        .await;

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(
        reply,
        vec![
            Content::text(Tag::Title, "ERROR"),
            Content::text(Tag::Error, "request timed out"),
        ]
    );
}

#[tokio::test]
async fn unparseable_body_aborts_without_reply() {
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(|req| async move { echo(req) }),
    );

    let mut broken = mail(1, "alice@example.com", "status", "hi");
    broken.body_structure = mail_gateway::mail::BodyStructure::MultiPart {
        media_type: "multipart/mixed".into(),
        boundary: None,
    };

    let outcome = dispatcher.process(broken).await;
    assert!(matches!(
        outcome,
        RequestOutcome::Aborted {
            request_id: Some(_)
        }
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn failure_before_request_id_logs_unknown_sentinel() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = PanickingStore {
        poisoned: "carol@example.com",
        inner: users(),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(store),
        Arc::new(ChannelSender { tx }),
        DispatchConfig::default(),
    ));
    dispatcher
        .on_message_receive(Arc::new(handler_fn(|req| async move { echo(req) })))
        .unwrap();

    let error_ids = ErrorIds::default();
    let subscriber = tracing_subscriber::registry().with(error_ids.clone());
    let guard = tracing::subscriber::set_default(subscriber);

    let outcome = dispatcher
        .process(mail(1, "carol@example.com", "status", "x"))
        .await;

    drop(guard);
    assert_eq!(outcome, RequestOutcome::Aborted { request_id: None });
    assert_eq!(*error_ids.0.lock().unwrap(), vec!["<UNKNOWN>".to_string()]);
    assert!(rx.try_recv().is_err());

    // The loop keeps serving mail after such a task.
    let (mail_tx, _error_tx) = start(&dispatcher);
    mail_tx
        .send(mail(2, "carol@example.com", "status", "x"))
        .await
        .unwrap();
    mail_tx
        .send(mail(3, "bob@example.com", "status", "x"))
        .await
        .unwrap();

    let (to, _) = next_reply(&mut rx).await;
    assert_eq!(to, "bob@example.com");
}

#[tokio::test]
async fn send_failure_is_reported_not_retried() {
    let dispatcher = Dispatcher::new(users(), Arc::new(FailingSender), DispatchConfig::default());
    dispatcher
        .on_message_receive(Arc::new(handler_fn(|req| async move { echo(req) })))
        .unwrap();

    let outcome = dispatcher
        .process(mail(1, "alice@example.com", "status", "hi"))
        .await;
    assert!(matches!(outcome, RequestOutcome::SendFailed { .. }));
}

#[tokio::test]
async fn contents_reach_handler_in_order() {
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(|req| async move { Ok::<_, Fault>(req.contents) }),
    );

    let raw = "From: alice@example.com\r\n\
To: bot@example.com\r\n\
Subject: Re: report; weekly\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--outer\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"data.bin\"\r\n\
\r\n\
BIN\r\n\
--outer--\r\n";
    let fetched = FetchedMessage::from_rfc822(7, None, raw.as_bytes()).unwrap();

    dispatcher.process(fetched).await;

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(reply.len(), 4);
    assert_eq!(reply[0], Content::text(Tag::Command, "report"));
    assert_eq!(reply[1], Content::text(Tag::Command, "weekly"));
    assert_eq!(reply[2].tag(), Tag::Body);
    assert!(reply[2].as_text().unwrap().starts_with("see attached"));
    match &reply[3] {
        Content::File { filename, content } => {
            assert_eq!(filename, "data.bin");
            assert!(content.to_bytes().starts_with(b"BIN"));
        }
        other => panic!("expected file item, got {other:?}"),
    }
}

// ── Dispatch loop ──────────────────────────────────────────────────────

#[tokio::test]
async fn panicking_handlers_do_not_stop_the_loop() {
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(|req| async move {
            if req.contents.first() == Some(&Content::text(Tag::Command, "panic")) {
                panic!("handler blew up");
            }
            echo(req)
        }),
    );
    let (mail_tx, _error_tx) = start(&dispatcher);

    const FAILING: u32 = 3;
    for seq in 1..=FAILING {
        mail_tx
            .send(mail(seq, "alice@example.com", "panic", "x"))
            .await
            .unwrap();
    }
    mail_tx
        .send(mail(FAILING + 1, "bob@example.com", "status", "x"))
        .await
        .unwrap();

    let mut errors = 0;
    let mut ok = 0;
    for _ in 0..=FAILING {
        let (to, reply) = next_reply(&mut rx).await;
        if reply[0] == Content::text(Tag::Title, "ERROR") {
            assert_eq!(to, "alice@example.com");
            assert_eq!(reply[1], Content::text(Tag::Error, "server error"));
            errors += 1;
        } else {
            assert_eq!(to, "bob@example.com");
            ok += 1;
        }
    }
    assert_eq!(errors, FAILING);
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn hung_handler_does_not_block_other_users() {
    let seen_ids = Arc::new(Mutex::new(Vec::new()));
    let ids = Arc::clone(&seen_ids);
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(move |req| {
            ids.lock().unwrap().push(req.request_id.clone());
            async move {
                if req.user.id == "u-alice" {
                    std::future::pending::<()>().await;
                }
                echo(req)
            }
        }),
    );
    let (mail_tx, _error_tx) = start(&dispatcher);

    mail_tx
        .send(mail(1, "alice@example.com", "status", "x"))
        .await
        .unwrap();
    mail_tx
        .send(mail(2, "bob@example.com", "status", "x"))
        .await
        .unwrap();

    let (to, reply) = next_reply(&mut rx).await;
    assert_eq!(to, "bob@example.com");
    assert!(reply[0].as_text().unwrap().starts_with("Bob:"));

    timeout(TEST_TIMEOUT, async {
        while seen_ids.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both handlers should be invoked");

    let ids = seen_ids.lock().unwrap().clone();
    assert_ne!(ids[0], ids[1]);
}

#[tokio::test]
async fn admission_cap_limits_concurrent_tasks() {
    let gate = Arc::new(Notify::new());
    let started = Arc::new(AtomicUsize::new(0));
    let (g, s) = (Arc::clone(&gate), Arc::clone(&started));
    let config = DispatchConfig {
        max_in_flight: 1,
        ..DispatchConfig::default()
    };
    let (dispatcher, mut rx) = gateway(
        config,
        handler_fn(move |req| {
            s.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&g);
            async move {
                if req.user.id == "u-alice" {
                    gate.notified().await;
                }
                echo(req)
            }
        }),
    );
    let (mail_tx, _error_tx) = start(&dispatcher);

    mail_tx
        .send(mail(1, "alice@example.com", "status", "x"))
        .await
        .unwrap();
    mail_tx
        .send(mail(2, "bob@example.com", "status", "x"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.available_slots(), 0);

    gate.notify_one();

    let (first, _) = next_reply(&mut rx).await;
    let (second, _) = next_reply(&mut rx).await;
    assert_eq!(first, "alice@example.com");
    assert_eq!(second, "bob@example.com");
}

#[tokio::test]
async fn listener_errors_drain_while_cap_is_reached() {
    let gate = Arc::new(Notify::new());
    let g = Arc::clone(&gate);
    let config = DispatchConfig {
        max_in_flight: 1,
        ..DispatchConfig::default()
    };
    let (dispatcher, mut rx) = gateway(
        config,
        handler_fn(move |req| {
            let gate = Arc::clone(&g);
            async move {
                if req.user.id == "u-alice" {
                    gate.notified().await;
                }
                echo(req)
            }
        }),
    );
    let (mail_tx, error_tx) = start(&dispatcher);

    mail_tx
        .send(mail(1, "alice@example.com", "status", "x"))
        .await
        .unwrap();
    mail_tx
        .send(mail(2, "bob@example.com", "status", "x"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.available_slots(), 0);

    // The error queue holds one item, so three sends only finish if the
    // loop keeps draining it while bob's mail waits for a slot.
    timeout(TEST_TIMEOUT, async {
        for attempt in 0..3 {
            error_tx
                .send(ChannelError::Protocol {
                    name: "stub".into(),
                    reason: format!("BAD #{attempt}"),
                })
                .await
                .unwrap();
        }
    })
    .await
    .expect("error queue was not drained");

    gate.notify_one();
    assert_eq!(next_reply(&mut rx).await.0, "alice@example.com");
    assert_eq!(next_reply(&mut rx).await.0, "bob@example.com");
}

#[tokio::test]
async fn listener_errors_are_not_fatal() {
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(|req| async move { echo(req) }),
    );
    let (mail_tx, error_tx) = start(&dispatcher);

    error_tx
        .send(ChannelError::Protocol {
            name: "stub".into(),
            reason: "BAD response".into(),
        })
        .await
        .unwrap();
    drop(error_tx);

    mail_tx
        .send(mail(1, "bob@example.com", "status", "x"))
        .await
        .unwrap();

    let (to, _) = next_reply(&mut rx).await;
    assert_eq!(to, "bob@example.com");
}

#[tokio::test]
async fn listen_wires_listener_to_loop() {
    let (dispatcher, mut rx) = gateway(
        DispatchConfig::default(),
        handler_fn(|req| async move { echo(req) }),
    );
    let listener = BatchListener {
        mails: Mutex::new(vec![
            mail(1, "alice@example.com", "status", "x"),
            mail(2, "bob@example.com", "status", "x"),
        ]),
    };

    let running = dispatcher.listen(&listener, Duration::from_secs(5), 20);

    let mut recipients = vec![next_reply(&mut rx).await.0, next_reply(&mut rx).await.0];
    recipients.sort();
    assert_eq!(recipients, vec!["alice@example.com", "bob@example.com"]);

    // The listener finished and dropped its queue, so the loop stops.
    timeout(TEST_TIMEOUT, running.dispatch)
        .await
        .expect("dispatch loop did not stop")
        .unwrap();
}
