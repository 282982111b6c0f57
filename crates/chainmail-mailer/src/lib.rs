//! # Chainmail Mailer
//!
//! SMTP implementation of the [`Mailer`] trait via async lettre.
//! One STARTTLS transport is built at construction and reused per send.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use chainmail_core::config::SmtpConfig;
use chainmail_core::error::{ChainmailError, Result};
use chainmail_core::traits::Mailer;

/// SMTP-backed mail transport.
pub struct SmtpMailer {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Build the transport from config.
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| ChainmailError::Mail(format!("SMTP relay: {e}")))?
            .port(config.port)
            .credentials(creds)
            .build();
        Ok(Self { config, transport })
    }

    fn from_mailbox(&self) -> Result<Mailbox> {
        let from = match &self.config.display_name {
            Some(name) => format!("{name} <{}>", self.config.from_address),
            None => self.config.from_address.clone(),
        };
        from.parse()
            .map_err(|e| ChainmailError::Mail(format!("Invalid from: {e}")))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| ChainmailError::Mail(format!("Invalid to: {e}")))?;

        let email = Message::builder()
            .from(self.from_mailbox()?)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .map_err(|e| ChainmailError::Mail(format!("Build email: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| ChainmailError::Mail(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Email sent to: {to}");
        Ok(())
    }
}
