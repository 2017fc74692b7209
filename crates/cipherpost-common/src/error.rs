//! Error types for Cipherpost

use thiserror::Error;

/// Main error type for Cipherpost
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("MIME error: {0}")]
    Mime(String),

    #[error("Key expired: {0}")]
    KeyExpired(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Cipherpost
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Mime(_) => "MIME_ERROR",
            Error::KeyExpired(_) => "KEY_EXPIRED",
            Error::Crypto(_) => "CRYPTO_ERROR",
            Error::Delivery(_) => "DELIVERY_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error reports an expired encryption key
    pub fn is_key_expired(&self) -> bool {
        matches!(self, Error::KeyExpired(_))
    }
}
