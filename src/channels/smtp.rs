//! Outbound mail sender: formats reply content as MIME and sends it via
//! SMTP with lettre.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::channels::MailSender;
use crate::config::SmtpConfig;
use crate::error::ChannelError;
use crate::models::{Content, Contents, Tag, User};

const CHANNEL_NAME: &str = "smtp";

/// SMTP reply sender.
pub struct SmtpSender {
    config: Arc<SmtpConfig>,
    app_name: String,
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: CHANNEL_NAME.into(),
        reason,
    }
}

impl SmtpSender {
    pub fn new(config: Arc<SmtpConfig>, app_name: impl Into<String>) -> Self {
        Self {
            config,
            app_name: app_name.into(),
        }
    }

    /// Reply subject: `[<app>] Response`, plus the first title if any.
    pub fn subject(&self, contents: &Contents) -> String {
        let title = contents
            .iter()
            .find(|c| c.tag() == Tag::Title)
            .and_then(|c| c.as_text());
        match title {
            Some(title) => format!("[{}] Response: {}", self.app_name, title),
            None => format!("[{}] Response", self.app_name),
        }
    }

    /// Build the MIME reply.
    pub fn build_message(&self, reply_to: &str, contents: &Contents) -> Result<Message, ChannelError> {
        let from = Mailbox::new(
            Some(self.app_name.clone()),
            self.config.from_address.parse().map_err(|e| ChannelError::InvalidAddress {
                address: self.config.from_address.clone(),
                reason: format!("{e}"),
            })?,
        );
        let to: Mailbox = reply_to.parse().map_err(|e| ChannelError::InvalidAddress {
            address: reply_to.to_string(),
            reason: format!("{e}"),
        })?;

        let rendered = render(contents);

        let mut body = match rendered.html {
            Some(html) => {
                MultiPart::mixed().multipart(MultiPart::alternative_plain_html(rendered.plain, html))
            }
            None => MultiPart::mixed().singlepart(SinglePart::plain(rendered.plain)),
        };
        for (filename, bytes) in rendered.attachments {
            let mime = mime_guess::from_path(&filename).first_or_octet_stream();
            let content_type = ContentType::parse(mime.as_ref())
                .map_err(|e| send_failed(format!("content type {mime}: {e}")))?;
            body = body.singlepart(Attachment::new(filename).body(bytes, content_type));
        }

        Message::builder()
            .from(from)
            .to(to)
            .subject(self.subject(contents))
            .multipart(body)
            .map_err(|e| send_failed(format!("Failed to build email: {e}")))
    }

    fn transport(&self) -> Result<SmtpTransport, ChannelError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        let builder = if self.config.port == 465 {
            SmtpTransport::relay(&self.config.host)
        } else {
            SmtpTransport::starttls_relay(&self.config.host)
        }
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?;

        Ok(builder
            .port(self.config.port)
            .credentials(creds)
            .timeout(Some(Duration::from_secs(30)))
            .build())
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn push(
        &self,
        user: &User,
        reply_to: &str,
        contents: &Contents,
    ) -> Result<(), ChannelError> {
        let message = self.build_message(reply_to, contents)?;
        let transport = self.transport()?;

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| send_failed(format!("send task panicked: {e}")))?
            .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

        tracing::info!(user = %user.name, "Reply sent to {reply_to}");
        Ok(())
    }
}

/// Reply content split into MIME pieces.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Rendered {
    pub plain: String,
    pub html: Option<String>,
    pub attachments: Vec<(String, Vec<u8>)>,
}

/// Lay out reply content: text items join the plain body, HTML items form
/// an HTML alternative, byte and file items become attachments.
pub fn render(contents: &Contents) -> Rendered {
    let mut plain: Vec<String> = Vec::new();
    let mut html: Vec<String> = Vec::new();
    let mut attachments = Vec::new();

    for (index, item) in contents.iter().enumerate() {
        match item {
            Content::Text { tag: Tag::Title, text } => {
                plain.push(format!("# {text}"));
                html.push(format!("<h1>{}</h1>", escape_html(text)));
            }
            Content::Text { text, .. } | Content::Markdown { markdown: text, .. } => {
                plain.push(text.clone());
                html.push(format!("<pre>{}</pre>", escape_html(text)));
            }
            Content::Html { html: fragment, .. } => {
                plain.push(strip_html(fragment));
                html.push(fragment.clone());
            }
            Content::Bytes { bytes, .. } => {
                attachments.push((format!("attachment-{index}{}", item.ext_name()), bytes.clone()));
            }
            Content::File { filename, content } => {
                attachments.push((filename.clone(), content.to_bytes()));
            }
        }
    }

    let has_html = contents.iter().any(|c| matches!(c, Content::Html { .. }));
    Rendered {
        plain: plain.join("\n\n"),
        html: has_html.then(|| html.join("\n")),
        attachments,
    }
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
