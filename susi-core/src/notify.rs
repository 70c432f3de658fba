//! Email notifications.
//!
//! [`GmailNotifier`] sends through the Gmail REST API with its own OAuth
//! token store. [`SmtpNotifier`] logs in to an SMTP relay over STARTTLS.
//! [`LogNotifier`] writes the notification to the log and is used when email
//! is switched off.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::info;

use crate::contract::Notifier;
use crate::credentials::TokenProvider;
use crate::error::PipelineError;
use crate::retry::RetryPolicy;

pub const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com";

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    let value = value.replace(['\r', '\n'], " ");
    if value.is_ascii() {
        value
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

/// Build a plain-text RFC 2822 message.
pub fn build_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    let body = body.replace("\r\n", "\n").replace('\n', "\r\n");
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=\"UTF-8\"\r\nContent-Transfer-Encoding: 8bit\r\n\r\n{body}",
        encode_header(from),
        encode_header(to),
        encode_header(subject),
    )
}

pub struct GmailNotifier {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    from: String,
    to: String,
    retry: RetryPolicy,
    base_url: String,
}

impl GmailNotifier {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            from: from.into(),
            to: to.into(),
            retry: RetryPolicy::default(),
            base_url: GMAIL_BASE_URL.to_string(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn send_once(&self, raw: &str) -> Result<(), PipelineError> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/gmail/v1/users/me/messages/send", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(status.as_u16(), &body));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for GmailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), PipelineError> {
        let message = build_message(&self.from, &self.to, subject, body);
        let raw = URL_SAFE.encode(message.as_bytes());
        self.retry
            .run("gmail send", || self.send_once(&raw))
            .await?;
        info!(subject, to = %self.to, "Notification email sent");
        Ok(())
    }
}

fn mailbox(field: &str, address: &str) -> Result<Mailbox, PipelineError> {
    address
        .parse()
        .map_err(|e| PipelineError::config(format!("{field} {address:?} is not a valid address: {e}")))
}

/// Plain-text message for the SMTP transport.
pub fn build_smtp_message(
    from: &Mailbox,
    to: &Mailbox,
    subject: &str,
    body: &str,
) -> Result<Message, PipelineError> {
    Message::builder()
        .from(from.clone())
        .to(to.clone())
        .subject(subject.replace(['\r', '\n'], " "))
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| PipelineError::config(format!("cannot build email: {e}")))
}

fn classify_smtp_error(e: lettre::transport::smtp::Error) -> PipelineError {
    if !e.is_permanent() {
        return PipelineError::transient(format!("smtp send failed: {e}"));
    }
    let code = e.status().map(|c| c.to_string()).unwrap_or_default();
    if code == "530" || code == "534" || code == "535" {
        PipelineError::auth(format!("smtp login rejected: {e}"))
    } else {
        PipelineError::platform(code, format!("smtp send rejected: {e}"))
    }
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    retry: RetryPolicy,
}

impl SmtpNotifier {
    /// Relay on `server:port` upgraded with STARTTLS. `username` logs in and
    /// is also the sender.
    pub fn new(
        server: &str,
        port: u16,
        username: &str,
        password: &str,
        to: &str,
    ) -> Result<Self, PipelineError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
            .map_err(|e| PipelineError::config(format!("invalid smtp server {server:?}: {e}")))?
            .port(port)
            .credentials(Credentials::new(username.to_string(), password.to_string()))
            .build();
        Ok(Self {
            transport,
            from: mailbox("email.username", username)?,
            to: mailbox("email.recipient", to)?,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), PipelineError> {
        let message = build_smtp_message(&self.from, &self.to, subject, body)?;
        self.retry
            .run("smtp send", || async {
                self.transport
                    .send(message.clone())
                    .await
                    .map(drop)
                    .map_err(classify_smtp_error)
            })
            .await?;
        info!(subject, to = %self.to, "Notification email sent");
        Ok(())
    }
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<(), PipelineError> {
        info!(subject, body, "Notification");
        Ok(())
    }
}
