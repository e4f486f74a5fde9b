//! Mailbox listener: polls an IMAP inbox over TLS and emits raw fetch
//! results.
//!
//! Each poll logs in, selects INBOX, searches UNSEEN, fetches every hit as
//! `INTERNALDATE RFC822`, flags it `\Seen` and logs out. The `\Seen` flag is
//! the only acknowledgement; the pipeline never deletes or flags anything.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::channels::{ListenerHandle, MailboxListener};
use crate::config::ImapConfig;
use crate::error::ChannelError;
use crate::mail::FetchedMessage;

const CHANNEL_NAME: &str = "imap";

static LITERAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}\r?\n$").expect("valid literal regex"));
static INTERNALDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("valid date regex"));

/// IMAP mailbox listener.
pub struct ImapListener {
    config: Arc<ImapConfig>,
}

impl ImapListener {
    pub fn new(config: Arc<ImapConfig>) -> Self {
        Self { config }
    }
}

impl MailboxListener for ImapListener {
    fn listen(
        &self,
        mails: mpsc::Sender<FetchedMessage>,
        errors: mpsc::Sender<ChannelError>,
        poll_interval: Duration,
    ) -> ListenerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let config = Arc::clone(&self.config);

        let handle = tokio::spawn(async move {
            info!(
                "Mailbox listener started, polling every {}s on {}",
                poll_interval.as_secs(),
                config.host
            );

            let mut tick = tokio::time::interval(poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tick.tick().await;

                if shutdown.load(Ordering::Relaxed) {
                    info!("Mailbox listener shutting down");
                    return;
                }

                let cfg = Arc::clone(&config);
                let fetched = match tokio::task::spawn_blocking(move || fetch_unseen(&cfg)).await {
                    Ok(Ok(messages)) => messages,
                    Ok(Err(e)) => {
                        if errors.send(e).await.is_err() {
                            debug!("Listener error queue closed");
                        }
                        continue;
                    }
                    Err(e) => {
                        let err = ChannelError::Disconnected {
                            name: CHANNEL_NAME.into(),
                            reason: format!("poll task panicked: {e}"),
                        };
                        if errors.send(err).await.is_err() {
                            debug!("Listener error queue closed");
                        }
                        continue;
                    }
                };

                if !fetched.is_empty() {
                    debug!("Fetched {} unseen messages", fetched.len());
                }

                for message in fetched {
                    if mails.send(message).await.is_err() {
                        info!("Mail queue closed, mailbox listener stopping");
                        return;
                    }
                }
            }
        });

        ListenerHandle::new(handle, shutdown_flag)
    }
}

/// Connect over TLS and run one fetch cycle (blocking, run via spawn_blocking).
pub fn fetch_unseen(config: &ImapConfig) -> Result<Vec<FetchedMessage>, ChannelError> {
    let startup = |reason: String| ChannelError::StartupFailed {
        name: CHANNEL_NAME.into(),
        reason,
    };

    let tcp = TcpStream::connect((&*config.host, config.port))
        .map_err(|e| startup(format!("connect {}:{}: {e}", config.host, config.port)))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| startup(e.to_string()))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| startup(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| startup(format!("TLS setup: {e}")))?;
    let tls = rustls::StreamOwned::new(conn, tcp);

    let mut session = ImapSession::new(tls);
    fetch_cycle(&mut session, config)
}

/// Run one LOGIN → SEARCH UNSEEN → FETCH → STORE → LOGOUT cycle.
pub fn fetch_cycle<S: Read + Write>(
    session: &mut ImapSession<S>,
    config: &ImapConfig,
) -> Result<Vec<FetchedMessage>, ChannelError> {
    session.greeting()?;

    let login = format!(
        "LOGIN {} {}",
        quote(&config.username),
        quote(config.password.expose_secret())
    );
    if let Err(e) = session.command(&login) {
        return Err(ChannelError::AuthFailed {
            name: CHANNEL_NAME.into(),
            reason: e.to_string(),
        });
    }

    session.command("SELECT \"INBOX\"")?;

    let search = session.command("SEARCH UNSEEN")?;
    let seq_nums: Vec<u32> = search
        .lines
        .iter()
        .filter(|line| line.starts_with("* SEARCH"))
        .flat_map(|line| line.split_whitespace().skip(2))
        .filter_map(|n| n.parse().ok())
        .collect();

    let mut results = Vec::with_capacity(seq_nums.len());
    for seq in seq_nums {
        // Earlier messages in this cycle are already flagged \Seen, so a
        // failed FETCH must not discard them.
        let fetch = match session.command(&format!("FETCH {seq} (INTERNALDATE RFC822)")) {
            Ok(fetch) => fetch,
            Err(e @ ChannelError::Disconnected { .. }) => {
                error!(seq, error = %e, kept = results.len(), "Connection lost during FETCH");
                return Ok(results);
            }
            Err(e) => {
                warn!(seq, error = %e, "FETCH failed, leaving message unseen");
                continue;
            }
        };
        let Some(raw) = fetch.literals.first() else {
            warn!(seq, "FETCH returned no message literal, skipping");
            continue;
        };
        let internal_date = fetch.lines.iter().find_map(|line| parse_internal_date(line));

        match FetchedMessage::from_rfc822(seq, internal_date, raw) {
            Ok(message) => results.push(message),
            Err(e) => warn!(seq, error = %e, "Skipping unreadable message"),
        }

        if let Err(e) = session.command(&format!("STORE {seq} +FLAGS (\\Seen)")) {
            warn!(seq, error = %e, "Failed to flag message as seen");
        }
    }

    let _ = session.command("LOGOUT");
    Ok(results)
}

/// Parse `INTERNALDATE "17-Jul-1996 02:44:25 -0700"` out of a response line.
pub fn parse_internal_date(line: &str) -> Option<DateTime<Utc>> {
    let raw = INTERNALDATE_RE.captures(line)?.get(1)?.as_str().trim();
    DateTime::parse_from_str(raw, "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Tagged response: untagged/continuation lines and any literals they carried.
#[derive(Debug, Default)]
pub struct Response {
    pub lines: Vec<String>,
    pub literals: Vec<Vec<u8>>,
}

/// Minimal synchronous IMAP client session.
pub struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    fn protocol(reason: impl Into<String>) -> ChannelError {
        ChannelError::Protocol {
            name: CHANNEL_NAME.into(),
            reason: reason.into(),
        }
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        let mut buf = Vec::new();
        let read = self
            .stream
            .read_until(b'\n', &mut buf)
            .map_err(|e| Self::protocol(e.to_string()))?;
        if read == 0 {
            return Err(ChannelError::Disconnected {
                name: CHANNEL_NAME.into(),
                reason: "connection closed".into(),
            });
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Read the server greeting.
    pub fn greeting(&mut self) -> Result<(), ChannelError> {
        let line = self.read_line()?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(Self::protocol(format!("unexpected greeting: {}", line.trim_end())))
        }
    }

    /// Send a tagged command and collect its response.
    pub fn command(&mut self, cmd: &str) -> Result<Response, ChannelError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let inner = self.stream.get_mut();
        inner
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .and_then(|()| inner.flush())
            .map_err(|e| Self::protocol(e.to_string()))?;

        let mut response = Response::default();
        loop {
            let line = self.read_line()?;

            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                return Err(Self::protocol(format!(
                    "{} failed: {}",
                    cmd.split_whitespace().next().unwrap_or(cmd),
                    status.trim_end()
                )));
            }

            if let Some(len) = LITERAL_RE
                .captures(&line)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<usize>().ok())
            {
                let mut literal = vec![0u8; len];
                self.stream
                    .read_exact(&mut literal)
                    .map_err(|e| Self::protocol(format!("short literal: {e}")))?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}
