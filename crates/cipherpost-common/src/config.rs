//! Configuration for Cipherpost

use crate::types::FailureMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default location of the main configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cipherpost/config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway behaviour
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Key store configuration
    #[serde(default)]
    pub gpg: GpgConfig,

    /// Outbound relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Exact-match recipient aliases used for key lookup
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    /// Ordered missing key rules. `None` when the section is absent.
    #[serde(default)]
    pub missing_key_rules: Option<Vec<RuleConfig>>,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Attach the processing marker header to every outgoing message
    #[serde(default)]
    pub add_header: bool,

    /// Behaviour when one recipient fails
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Number of recipients processed at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deprecated: drop (true) or send in clear (false) when no key exists.
    /// Only honoured when no `missing_key_rules` section is configured.
    pub force_encrypt: Option<bool>,

    /// Subject of the missing key notification
    pub missing_key_notification_subject: Option<String>,

    /// Inline body template of the missing key notification
    pub missing_key_notification_body: Option<String>,

    /// File holding the body template of the missing key notification
    pub missing_key_notification_file: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            add_header: false,
            failure_mode: FailureMode::default(),
            concurrency: default_concurrency(),
            force_encrypt: None,
            missing_key_notification_subject: None,
            missing_key_notification_body: None,
            missing_key_notification_file: None,
        }
    }
}

fn default_concurrency() -> usize {
    1
}

impl GatewayConfig {
    /// Resolve the notification body template.
    ///
    /// The inline body wins over the file.
    pub fn notification_template(&self) -> crate::Result<Option<String>> {
        if let Some(body) = &self.missing_key_notification_body {
            return Ok(Some(body.clone()));
        }

        match &self.missing_key_notification_file {
            Some(path) => {
                let body = std::fs::read_to_string(path).map_err(|e| {
                    crate::Error::Config(format!(
                        "Failed to read notification file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }
}

/// Key store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreBackend {
    /// GnuPG command line tool
    #[default]
    Gnupg,
}

/// Key store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpgConfig {
    /// Backend implementation
    #[serde(default)]
    pub backend: KeyStoreBackend,

    /// Path or name of the gpg executable
    #[serde(default = "default_gpg_binary")]
    pub binary: PathBuf,

    /// Key store home directory
    #[serde(default = "default_gpg_home")]
    pub home: PathBuf,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            backend: KeyStoreBackend::default(),
            binary: default_gpg_binary(),
            home: default_gpg_home(),
        }
    }
}

fn default_gpg_binary() -> PathBuf {
    PathBuf::from("gpg")
}

fn default_gpg_home() -> PathBuf {
    PathBuf::from("/var/lib/cipherpost/gnupg")
}

/// Outbound relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay host
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Relay port
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Upgrade the connection with STARTTLS
    #[serde(default)]
    pub starttls: bool,

    /// SMTP username
    pub username: Option<String>,

    /// SMTP password
    pub password: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            starttls: false,
            username: None,
            password: None,
        }
    }
}

fn default_relay_host() -> String {
    "localhost".to_string()
}

fn default_relay_port() -> u16 {
    10026
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Absolute path of a log file; standard error when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// A missing key rule as written in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Regular expression matched against the recipient address
    pub pattern: String,

    /// One of "drop", "notify", "cleartext"
    pub action: String,
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let table = read_table(path)?;
        Self::from_table(table)
    }

    /// Load the main configuration file and, when `read_partial` is set, the
    /// partial files of the `<path>.d` directory.
    ///
    /// Partials are applied in reverse lexical order, so `001-local.toml`
    /// has the last word. Returns the configuration and the files read.
    pub fn load(path: &Path, read_partial: bool) -> crate::Result<(Self, Vec<PathBuf>)> {
        let mut table = read_table(path)?;
        let mut read_files = vec![path.to_path_buf()];

        if read_partial {
            let partial_dir = partial_dir(path);
            match std::fs::read_dir(&partial_dir) {
                Ok(entries) => {
                    let mut partials = entries
                        .filter_map(|entry| entry.ok())
                        .map(|entry| entry.path())
                        .filter(|path| path.is_file())
                        .collect::<Vec<_>>();
                    partials.sort();
                    partials.reverse();

                    for partial in partials {
                        let overlay = read_table(&partial)?;
                        merge_tables(&mut table, overlay);
                        read_files.push(partial);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("No partial configuration directory at {}", partial_dir.display());
                }
                Err(e) => {
                    return Err(crate::Error::Config(format!(
                        "Failed to read {}: {}",
                        partial_dir.display(),
                        e
                    )))
                }
            }
        }

        Ok((Self::from_table(table)?, read_files))
    }

    fn from_table(table: toml::Table) -> crate::Result<Self> {
        let config: Config = toml::Value::Table(table)
            .try_into()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot check on its own
    pub fn validate(&self) -> crate::Result<()> {
        if self.gateway.concurrency == 0 {
            return Err(crate::Error::Config(
                "gateway.concurrency must be at least 1".to_string(),
            ));
        }

        if let Some(file) = &self.logging.file {
            if !file.is_absolute() {
                return Err(crate::Error::Config(format!(
                    "Logging file {} is not an absolute path",
                    file.display()
                )));
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "Unknown logging format '{}'",
                    other
                )))
            }
        }

        Ok(())
    }
}

fn partial_dir(path: &Path) -> PathBuf {
    let mut dir = path.as_os_str().to_os_string();
    dir.push(".d");
    PathBuf::from(dir)
}

fn read_table(path: &Path) -> crate::Result<toml::Table> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    content.parse::<toml::Table>().map_err(|e| {
        crate::Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Merge `overlay` into `base`: tables are merged key by key, anything else
/// is replaced.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
