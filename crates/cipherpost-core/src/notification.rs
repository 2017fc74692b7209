//! Missing key notifications
//!
//! When policy says `notify`, the recipient receives a short plain text
//! message instead of the original.

use crate::mime::Message;
use cipherpost_common::config::GatewayConfig;
use cipherpost_common::{Error, Result};
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;

/// Subject used when none is configured
pub const DEFAULT_SUBJECT: &str = "Missing PGP key";

/// Body used when no template is configured
pub const DEFAULT_TEMPLATE: &str = "Hello,

a message from {{sender}} was addressed to you, but the mail gateway could
not find a PGP key for {{recipient}}. The message has not been delivered.

Please ask the administrator of the gateway to add your public key, and
ask the sender to send the message again.
";

/// Builds the notification sent in place of a message
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    subject: String,
    template: String,
}

impl Default for NotificationBuilder {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl NotificationBuilder {
    pub fn new(subject: Option<String>, template: Option<String>) -> Self {
        Self {
            subject: subject.unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            template: template.unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        }
    }

    /// Read subject and template from the gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Ok(Self::new(
            config.missing_key_notification_subject.clone(),
            config.notification_template()?,
        ))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Render the body template for one recipient
    pub fn render(&self, original: &Message, recipient: &str) -> String {
        let sender = original.headers.get("From").map(unfold).unwrap_or_default();
        let subject = original.headers.get("Subject").map(unfold).unwrap_or_default();

        self.template
            .replace("{{recipient}}", recipient)
            .replace("{{sender}}", &sender)
            .replace("{{subject}}", &subject)
    }

    /// Build the notification for `recipient`. `From` is copied from the
    /// original message.
    pub fn build(&self, original: &Message, recipient: &str) -> Result<Message> {
        let body = self.render(original, recipient);
        let from = original.headers.get("From").map(unfold);

        let mut builder = MessageBuilder::new()
            .to(recipient)
            .subject(self.subject.as_str())
            .header("Auto-Submitted", Raw::new("auto-generated"))
            .text_body(body);

        if let Some(from) = from {
            builder = builder.header("From", Raw::new(from));
        }

        let bytes = builder
            .write_to_vec()
            .map_err(|e| Error::Mime(format!("Failed to build notification: {}", e)))?;

        Message::parse(&bytes)
    }
}

/// Join folded header lines
fn unfold(value: &str) -> String {
    value.replace("\r\n", "").replace('\n', "")
}
