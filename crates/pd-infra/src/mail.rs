use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::SMTP_PORT;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::{Error, Result};

/// Outbound notification sender.
#[async_trait]
pub trait MailSender: Send + Sync + 'static {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Sender delivering through the cluster's SMTP relay.
///
/// The relay is internal and unauthenticated, so the transport speaks
/// plain ESMTP to it.
pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
}

impl SmtpSender {
    /// `server` is `host[:port]` of the relay; `sender` becomes the
    /// From address of every message.
    pub fn new(server: &str, sender: impl Into<String>) -> Result<Self> {
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::MailRelay(server.to_string()))?,
            ),
            None => (server, SMTP_PORT),
        };

        if host.is_empty() {
            return Err(Error::MailRelay(server.to_string()));
        }

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .build();

        Ok(Self {
            transport,
            sender: sender.into(),
        })
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let message = Message::builder()
            .from(self.sender.parse()?)
            .to(recipient.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())?;

        self.transport.send(message).await?;

        info!(recipient, subject, "mail sent");
        Ok(())
    }
}
