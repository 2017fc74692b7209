//! Encryption capability
//!
//! The pipeline only talks to a [`KeyStore`]. Each concrete OpenPGP
//! implementation lives behind its own adapter, selected once at startup
//! by [`build_keystore`].

mod gnupg;

pub use gnupg::GnupgKeyStore;

use async_trait::async_trait;
use cipherpost_common::config::{GpgConfig, KeyStoreBackend};
use cipherpost_common::{KeyRef, Result};
use std::sync::Arc;

/// Key lookup and encryption backend
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Find the key for `address`. `Ok(None)` when no key exists.
    async fn lookup(&self, address: &str) -> Result<Option<KeyRef>>;

    /// Whether `key` is expired now
    async fn is_expired(&self, key: &KeyRef) -> Result<bool> {
        Ok(key.expired)
    }

    /// Encrypt `plaintext` to every key in `keys`, returning ASCII armor.
    ///
    /// Fails with `Error::KeyExpired` when one of the keys is expired.
    async fn encrypt(&self, plaintext: &[u8], keys: &[KeyRef]) -> Result<Vec<u8>>;
}

/// Create the key store selected by the configuration
pub fn build_keystore(config: &GpgConfig) -> Arc<dyn KeyStore> {
    match config.backend {
        KeyStoreBackend::Gnupg => Arc::new(GnupgKeyStore::new(&config.binary, &config.home)),
    }
}
