//! # notify::email
//!
//! ส่งแจ้งเตือนทาง e-mail ผ่าน SMTP (plain text, one mail per message).
//! Port 465 uses implicit TLS, any other port STARTTLS unless TLS is turned
//! off for a local relay.

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::debug;

use crate::error::AppError;
use crate::models::Priority;
use crate::notify::{Message, Notifier};

const IMPLICIT_TLS_PORT: u16 = 465;

/// SMTP settings as read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailConfig {
    pub host:     String,
    pub port:     u16,
    /// `None` for relays that accept unauthenticated mail
    pub username: Option<String>,
    pub password: Option<String>,
    pub from:     String,
    /// Comma-separated in `EMAIL_TO`
    pub to:       Vec<String>,
    pub tls:      bool,
}

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from:      Mailbox,
    to:        Vec<Mailbox>,
}

impl EmailNotifier {
    /// Validates the addresses and prepares the transport.  No connection is
    /// opened until the first send.
    pub fn new(config: &EmailConfig) -> Result<Self, AppError> {
        let from = parse_mailbox(&config.from)?;
        let to = config.to.iter().map(|a| parse_mailbox(a)).collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(AppError::ConfigInvalid("EMAIL_TO has no recipients".into()));
        }

        let builder = if !config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        } else if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| AppError::ConfigInvalid(format!("smtp {}: {e}", config.host)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| AppError::ConfigInvalid(format!("smtp {}: {e}", config.host)))?
        };
        let mut builder = builder.port(config.port);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self { transport: builder.build(), from, to })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, AppError> {
    address
        .trim()
        .parse()
        .map_err(|e| AppError::ConfigInvalid(format!("e-mail address '{address}': {e}")))
}

pub fn subject(message: &Message) -> String {
    match message.priority {
        Priority::Critical => format!("[CRITICAL] {}", message.title),
        Priority::Important => format!("[IMPORTANT] {}", message.title),
        Priority::Normal => message.title.clone(),
    }
}

pub fn build_email(from: &Mailbox, to: &[Mailbox], message: &Message) -> Result<lettre::Message, AppError> {
    let mut builder = lettre::Message::builder().from(from.clone()).subject(subject(message));
    for recipient in to {
        builder = builder.to(recipient.clone());
    }
    builder
        .header(ContentType::TEXT_PLAIN)
        .body(message.body())
        .map_err(|e| AppError::DeliveryFailed(format!("email: {e}")))
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, message: &Message) -> Result<(), AppError> {
        let email = build_email(&self.from, &self.to, message)?;
        let response = self
            .transport
            .send(email)
            .await
            .map_err(|e| AppError::DeliveryFailed(format!("email: {e}")))?;

        debug!(code = %response.code(), recipients = self.to.len(), "E-mail sent");
        Ok(())
    }
}
