//! Common types for Cipherpost

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference to an encryption key held by the key store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRef {
    /// Opaque key identifier understood by the key store
    pub id: String,
    /// Whether the key store reported the key as expired at lookup time
    pub expired: bool,
}

impl KeyRef {
    /// Create a reference to a usable key
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expired: false,
        }
    }

    /// Create a reference to an expired key
    pub fn expired(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expired: true,
        }
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// What to do with a recipient that has no usable key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Do not send anything to the recipient
    Drop,
    /// Send the recipient a notification instead of the message
    #[default]
    Notify,
    /// Send the original message unencrypted
    Cleartext,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Drop => "drop",
            Disposition::Notify => "notify",
            Disposition::Cleartext => "cleartext",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Disposition::Drop),
            "notify" => Ok(Disposition::Notify),
            "cleartext" => Ok(Disposition::Cleartext),
            other => Err(crate::Error::Config(format!(
                "Unknown missing key action '{}' (expected drop, notify or cleartext)",
                other
            ))),
        }
    }
}

/// How a processing call reacts to a failing recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Keep processing the remaining recipients and report every failure
    #[default]
    Continue,
    /// Do not start any further recipient once one has failed
    Abort,
}
