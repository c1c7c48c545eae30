//! Outbound notifications

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Mutex;
use tracing::{debug, info};

use strata_core::{Error, Result};

use crate::config::ContactConfig;

/// A plain-text message to a list of recipients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .parse::<Mailbox>()
        .map_err(|e| Error::WrongTask(format!("invalid email address {:?}: {}", address, e)))
}

/// Sends mail through an implicit-TLS SMTP relay
pub struct SmtpNotifier {
    sender: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(contact: &ContactConfig) -> Result<Self> {
        let sender = mailbox(&contact.sender_email)
            .map_err(|e| Error::Config(format!("contact.sender_email: {}", e)))?;
        let username = if contact.smtp_username.is_empty() {
            contact.sender_email.clone()
        } else {
            contact.smtp_username.clone()
        };
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&contact.smtp_server)
            .map_err(|e| Error::Config(format!("SMTP relay {}: {}", contact.smtp_server, e)))?
            .port(contact.smtp_port)
            .credentials(Credentials::new(username, contact.smtp_password.clone()))
            .build();
        Ok(Self { sender, transport })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &notification.recipients {
            builder = builder.to(mailbox(recipient)?);
        }
        let message = builder
            .body(notification.body.clone())
            .map_err(|e| Error::MalformedData(format!("cannot build email: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| Error::RemoteUnreachable(format!("SMTP: {}", e)))?;
        info!(
            recipients = notification.recipients.len(),
            "Sent notification {:?}", notification.subject
        );
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<Notification> {
        self.sent().pop()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        for recipient in &notification.recipients {
            mailbox(recipient)?;
        }
        debug!("Recorded notification {:?}", notification.subject);
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.clone());
        Ok(())
    }
}
