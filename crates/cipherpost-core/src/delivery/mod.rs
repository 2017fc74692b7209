//! Delivery capability
//!
//! Finished messages are handed to a [`Transport`]; the SMTP relay adapter
//! is the production implementation.

mod smtp;

pub use smtp::SmtpRelay;

use async_trait::async_trait;
use cipherpost_common::Result;

/// Hands a serialized message to the next hop
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to `to`. `from` is the envelope sender; `None`
    /// sends with a null reverse-path.
    async fn deliver(&self, message: &[u8], from: Option<&str>, to: &[String]) -> Result<()>;
}
