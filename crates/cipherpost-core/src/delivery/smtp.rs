//! SMTP relay transport

use super::Transport;
use async_trait::async_trait;
use cipherpost_common::config::RelayConfig;
use cipherpost_common::{Error, Result};
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;
use tracing::{debug, info};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivers messages to a downstream SMTP relay
#[derive(Clone)]
pub struct SmtpRelay {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
}

impl SmtpRelay {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let mut transport = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(|e| {
                Error::Config(format!("Invalid relay host '{}': {}", config.host, e))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let mailer = transport.timeout(Some(SMTP_TIMEOUT)).build();

        Ok(Self {
            mailer,
            host: config.host.clone(),
            port: config.port,
        })
    }
}

#[async_trait]
impl Transport for SmtpRelay {
    async fn deliver(&self, message: &[u8], from: Option<&str>, to: &[String]) -> Result<()> {
        let sender = from
            .map(|addr| {
                addr.parse::<Address>()
                    .map_err(|e| Error::Delivery(format!("Invalid sender address '{}': {}", addr, e)))
            })
            .transpose()?;

        let recipients = to
            .iter()
            .map(|addr| {
                addr.parse::<Address>()
                    .map_err(|e| Error::Delivery(format!("Invalid recipient address '{}': {}", addr, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let envelope = Envelope::new(sender, recipients)
            .map_err(|e| Error::Delivery(format!("Invalid envelope: {}", e)))?;

        let data = to_crlf(message);
        debug!(
            relay = %format!("{}:{}", self.host, self.port),
            size = data.len(),
            "Sending message"
        );

        let response = self
            .mailer
            .send_raw(&envelope, &data)
            .await
            .map_err(|e| Error::Delivery(format!("Relay {}:{} refused message: {}", self.host, self.port, e)))?;

        info!(
            recipients = %to.join(", "),
            code = %response.code(),
            "Message relayed"
        );

        Ok(())
    }
}

/// Normalise bare LF line endings to CRLF
fn to_crlf(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + message.len() / 32);
    let mut previous = 0u8;

    for &byte in message {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }

    out
}
