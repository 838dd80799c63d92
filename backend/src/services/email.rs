use crate::config::SmtpConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::services::notifier::{Notification, Notifier};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

/// SMTP delivery for `notify` steps on the email channel
#[derive(Debug, Clone)]
pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl EmailService {
    pub fn new(smtp_config: &SmtpConfig) -> WorkflowResult<Self> {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let builder = if smtp_config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp_config.host)
                .map_err(|e| WorkflowError::invalid(format!("invalid SMTP relay '{}': {}", smtp_config.host, e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
        };

        let transport = builder
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Ok(EmailService {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        })
    }

    pub async fn send_email(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        subject: &str,
        text_body: &str,
    ) -> WorkflowResult<()> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| WorkflowError::invalid(format!("invalid sender address: {}", e)))?;

        let to = match to_name {
            Some(name) => format!("{} <{}>", name, to_email).parse::<Mailbox>(),
            None => to_email.parse::<Mailbox>(),
        }
        .map_err(|e| WorkflowError::execution(format!("invalid recipient '{}': {}", to_email, e)))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(text_body.to_string())
            .map_err(|e| WorkflowError::execution(format!("failed to build email: {}", e)))?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", to_email);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", to_email, e);
                Err(WorkflowError::execution(format!("smtp delivery to {} failed: {}", to_email, e)))
            }
        }
    }
}

#[async_trait]
impl Notifier for EmailService {
    async fn notify(&self, notification: &Notification) -> WorkflowResult<()> {
        let recipient = notification
            .recipient
            .as_deref()
            .ok_or_else(|| WorkflowError::execution("email notification has no recipient"))?;

        self.send_email(
            recipient,
            Some(&notification.username),
            &notification.subject,
            &notification.message,
        )
        .await
    }
}
