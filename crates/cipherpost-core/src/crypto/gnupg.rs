//! GnuPG command line adapter

use super::KeyStore;
use async_trait::async_trait;
use chrono::Utc;
use cipherpost_common::{Error, KeyRef, Result};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Key store backed by a `gpg` executable and an explicit home directory
#[derive(Debug, Clone)]
pub struct GnupgKeyStore {
    binary: PathBuf,
    home: PathBuf,
}

impl GnupgKeyStore {
    pub fn new(binary: impl AsRef<Path>, home: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            home: home.as_ref().to_path_buf(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--batch")
            .arg("--no-tty")
            .arg("--homedir")
            .arg(&self.home)
            .kill_on_drop(true);
        cmd
    }

    async fn list_keys(&self, query: &str) -> Result<Vec<ListedKey>> {
        let output = self
            .command()
            .args(["--with-colons", "--list-keys", "--", query])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let keys = parse_colon_listing(&String::from_utf8_lossy(&output.stdout), Utc::now().timestamp());
        if !output.status.success() && keys.is_empty() {
            debug!(
                query = %query,
                status = %output.status,
                "gpg listed no keys: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(keys)
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        Error::Crypto(format!("Failed to run {}: {}", self.binary.display(), e))
    }
}

#[async_trait]
impl KeyStore for GnupgKeyStore {
    async fn lookup(&self, address: &str) -> Result<Option<KeyRef>> {
        let keys = self.list_keys(address).await?;
        let key = select_key(&keys, address);

        match &key {
            Some(key) => debug!(recipient = %address, key = %key.id, expired = key.expired, "Found key"),
            None => debug!(recipient = %address, "No key found"),
        }

        Ok(key)
    }

    async fn is_expired(&self, key: &KeyRef) -> Result<bool> {
        let keys = self.list_keys(&key.id).await?;
        keys.iter()
            .find(|listed| listed.matches_id(&key.id))
            .map(|listed| listed.expired)
            .ok_or_else(|| Error::Crypto(format!("Key {} is no longer in the key store", key.id)))
    }

    async fn encrypt(&self, plaintext: &[u8], keys: &[KeyRef]) -> Result<Vec<u8>> {
        if let Some(key) = keys.iter().find(|key| key.expired) {
            return Err(Error::KeyExpired(key.id.clone()));
        }
        if keys.is_empty() {
            return Err(Error::Crypto("No recipient keys given".to_string()));
        }

        let mut cmd = self.command();
        cmd.args(["--armor", "--trust-model", "always", "--encrypt"]);
        for key in keys {
            cmd.arg("--recipient").arg(&key.id);
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Crypto("gpg stdin is not available".to_string()))?;
        let input = plaintext.to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        let written = writer
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("gpg input task failed: {}", e)))?;

        check_encrypt_output(&output, keys)?;
        written?;

        Ok(output.stdout)
    }
}

fn check_encrypt_output(output: &Output, keys: &[KeyRef]) -> Result<()> {
    if output.status.success() && !output.stdout.is_empty() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let ids = keys.iter().map(|k| k.id.as_str()).collect::<Vec<_>>().join(", ");

    if stderr.to_ascii_lowercase().contains("expired") {
        warn!(keys = %ids, "gpg refused an expired key");
        return Err(Error::KeyExpired(ids));
    }

    Err(Error::Crypto(format!(
        "gpg encryption failed ({}): {}",
        output.status,
        stderr.trim()
    )))
}

/// A public key from `gpg --with-colons` output
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedKey {
    key_id: String,
    fingerprint: Option<String>,
    expired: bool,
    usable: bool,
    uids: Vec<String>,
}

impl ListedKey {
    fn id(&self) -> &str {
        self.fingerprint.as_deref().unwrap_or(&self.key_id)
    }

    fn matches_id(&self, id: &str) -> bool {
        self.key_id.eq_ignore_ascii_case(id)
            || self
                .fingerprint
                .as_deref()
                .is_some_and(|fpr| fpr.eq_ignore_ascii_case(id))
    }

    fn has_address(&self, address: &str) -> bool {
        self.uids
            .iter()
            .any(|uid| uid_address(uid).eq_ignore_ascii_case(address))
    }
}

/// Parse the `pub`, `fpr` and `uid` records of a colon listing
fn parse_colon_listing(listing: &str, now: i64) -> Vec<ListedKey> {
    let mut keys: Vec<ListedKey> = Vec::new();
    // Fingerprint records after a subkey belong to the subkey
    let mut in_primary = false;

    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        let field = |i: usize| fields.get(i).copied().unwrap_or_default();

        match field(0) {
            "pub" => {
                let validity = field(1);
                let expires = field(6).parse::<i64>().ok().filter(|ts| *ts > 0);

                keys.push(ListedKey {
                    key_id: field(4).to_string(),
                    fingerprint: None,
                    expired: validity == "e" || expires.is_some_and(|ts| ts <= now),
                    usable: !matches!(validity, "r" | "i") && !field(11).contains('D'),
                    uids: Vec::new(),
                });
                in_primary = true;
            }
            "fpr" if in_primary => {
                if let Some(key) = keys.last_mut() {
                    if key.fingerprint.is_none() && !field(9).is_empty() {
                        key.fingerprint = Some(field(9).to_string());
                    }
                }
            }
            "uid" => {
                if field(1) != "r" {
                    if let Some(key) = keys.last_mut() {
                        key.uids.push(unescape(field(9)));
                    }
                }
            }
            "sub" | "ssb" => in_primary = false,
            _ => {}
        }
    }

    keys
}

/// Pick the key for `address`, preferring one that has not expired
fn select_key(keys: &[ListedKey], address: &str) -> Option<KeyRef> {
    let mut candidates = keys
        .iter()
        .filter(|key| key.usable && key.has_address(address));
    let first = candidates.clone().next()?;
    let key = candidates.find(|key| !key.expired).unwrap_or(first);

    Some(KeyRef {
        id: key.id().to_string(),
        expired: key.expired,
    })
}

/// The mail address of a user id such as `Name (comment) <addr>`
fn uid_address(uid: &str) -> &str {
    match (uid.rfind('<'), uid.rfind('>')) {
        (Some(start), Some(end)) if start < end => uid[start + 1..end].trim(),
        _ => uid.trim(),
    }
}

/// Decode the `\xNN` escapes gpg uses in colon listings
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let hex = rest.get(pos + 2..pos + 4);
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) if byte.is_ascii() => {
                out.push(byte as char);
                rest = &rest[pos + 4..];
            }
            _ => {
                out.push_str("\\x");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);

    out
}
