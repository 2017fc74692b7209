//! Per-recipient processing pipeline
//!
//! Each recipient goes through alias resolution, key lookup, then either
//! encryption or the missing key policy. The resulting message is tagged
//! and handed to the transport. Recipients never share mutable state, so
//! they may run concurrently; results keep the input order.

use crate::address::AliasResolver;
use crate::crypto::KeyStore;
use crate::delivery::Transport;
use crate::mime::{build_encrypted_envelope, encode_for_encryption, Message};
use crate::notification::NotificationBuilder;
use crate::policy::MissingKeyPolicy;
use cipherpost_common::{Config, Disposition, Error, FailureMode, Result};
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name of the processing marker header
pub const MARKER_HEADER: &str = "X-Cipherpost";

/// Value of the processing marker header
pub fn marker_value() -> String {
    format!("processed by cipherpost v{}", env!("CARGO_PKG_VERSION"))
}

/// How a dispatched message was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Encrypted,
    Cleartext,
    Notified,
}

/// A message handed to the transport for one recipient
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub recipient: String,
    pub kind: DispatchKind,
    pub message: Message,
}

/// Processing step in which a recipient failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lookup,
    Encrypt,
    Policy,
    Dispatch,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Lookup => "lookup",
            Stage::Encrypt => "encrypt",
            Stage::Policy => "policy",
            Stage::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single recipient
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed for {recipient}: {error}")]
pub struct RecipientFailure {
    pub recipient: String,
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl RecipientFailure {
    fn new(recipient: &str, stage: Stage, error: Error) -> Self {
        Self {
            recipient: recipient.to_string(),
            stage,
            error,
        }
    }
}

/// Outcome of one processing call
#[derive(Debug, Default)]
pub struct ProcessReport {
    /// Messages handed to the transport, in recipient order
    pub dispatched: Vec<Dispatched>,
    /// Recipients dropped by policy
    pub dropped: Vec<String>,
    /// Recipients that failed
    pub failures: Vec<RecipientFailure>,
    /// Recipients not started because an earlier one failed
    pub skipped: Vec<String>,
}

impl ProcessReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }

    /// The dispatched messages, in recipient order
    pub fn messages(&self) -> Vec<&Message> {
        self.dispatched.iter().map(|d| &d.message).collect()
    }

    /// The dispatched messages, or the first failure
    pub fn into_result(self) -> std::result::Result<Vec<Dispatched>, RecipientFailure> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(self.dispatched),
        }
    }
}

enum Outcome {
    Dispatched(Dispatched),
    Dropped(String),
    Failed(RecipientFailure),
    Skipped(String),
}

/// Runs messages through lookup, encryption or policy, and delivery
pub struct Pipeline {
    resolver: AliasResolver,
    policy: MissingKeyPolicy,
    keystore: Arc<dyn KeyStore>,
    transport: Arc<dyn Transport>,
    notifications: NotificationBuilder,
    add_header: bool,
    failure_mode: FailureMode,
    concurrency: usize,
}

impl Pipeline {
    /// Create a pipeline with no aliases, no rules and default settings
    pub fn new(keystore: Arc<dyn KeyStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            resolver: AliasResolver::default(),
            policy: MissingKeyPolicy::default(),
            keystore,
            transport,
            notifications: NotificationBuilder::default(),
            add_header: false,
            failure_mode: FailureMode::default(),
            concurrency: 1,
        }
    }

    /// Create a pipeline from the loaded configuration
    pub fn from_config(
        config: &Config,
        keystore: Arc<dyn KeyStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let gateway = &config.gateway;
        let policy = MissingKeyPolicy::from_config(
            config.missing_key_rules.as_deref(),
            gateway.force_encrypt,
        );

        Ok(Self::new(keystore, transport)
            .with_aliases(config.aliases.clone())
            .with_policy(policy)
            .with_notifications(NotificationBuilder::from_config(gateway)?)
            .with_add_header(gateway.add_header)
            .with_failure_mode(gateway.failure_mode)
            .with_concurrency(gateway.concurrency))
    }

    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.resolver = AliasResolver::new(aliases);
        self
    }

    pub fn with_policy(mut self, policy: MissingKeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_notifications(mut self, notifications: NotificationBuilder) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_add_header(mut self, add_header: bool) -> Self {
        self.add_header = add_header;
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Process one raw message for every recipient.
    ///
    /// Only a message that cannot be parsed fails the whole call; recipient
    /// failures are collected in the report.
    pub async fn process(&self, raw: &[u8], recipients: &[String]) -> Result<ProcessReport> {
        let message = Message::parse(raw)?;
        let sender = envelope_sender(raw);
        let aborted = AtomicBool::new(false);

        debug!(
            sender = sender.as_deref().unwrap_or("<>"),
            recipients = recipients.len(),
            "Processing message"
        );

        let outcomes: Vec<Outcome> = stream::iter(recipients)
            .map(|recipient| self.process_recipient(&message, sender.as_deref(), recipient, &aborted))
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut report = ProcessReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Dispatched(dispatched) => report.dispatched.push(dispatched),
                Outcome::Dropped(recipient) => report.dropped.push(recipient),
                Outcome::Failed(failure) => report.failures.push(failure),
                Outcome::Skipped(recipient) => report.skipped.push(recipient),
            }
        }

        if !report.skipped.is_empty() {
            warn!(
                skipped = %report.skipped.join(", "),
                "Recipients skipped after an earlier failure"
            );
        }
        info!(
            dispatched = report.dispatched.len(),
            dropped = report.dropped.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "Message processed"
        );

        Ok(report)
    }

    async fn process_recipient(
        &self,
        message: &Message,
        sender: Option<&str>,
        recipient: &str,
        aborted: &AtomicBool,
    ) -> Outcome {
        if self.is_aborted(aborted) {
            return Outcome::Skipped(recipient.to_string());
        }

        let prepared = match self.prepare(message, recipient).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => {
                info!(recipient = %recipient, "Dropping message, no key and policy says drop");
                return Outcome::Dropped(recipient.to_string());
            }
            Err(failure) => return self.fail(failure, aborted),
        };

        let (kind, mut output) = prepared;
        if self.add_header {
            output.headers.set(MARKER_HEADER, marker_value());
        }

        if self.is_aborted(aborted) {
            return Outcome::Skipped(recipient.to_string());
        }

        let bytes = output.to_bytes();
        if let Err(e) = self
            .transport
            .deliver(&bytes, sender, &[recipient.to_string()])
            .await
        {
            return self.fail(RecipientFailure::new(recipient, Stage::Dispatch, e), aborted);
        }

        info!(recipient = %recipient, kind = ?kind, "Message dispatched");
        Outcome::Dispatched(Dispatched {
            recipient: recipient.to_string(),
            kind,
            message: output,
        })
    }

    /// Build the message for `recipient`; `None` when it is dropped
    async fn prepare(
        &self,
        message: &Message,
        recipient: &str,
    ) -> std::result::Result<Option<(DispatchKind, Message)>, RecipientFailure> {
        let lookup_address = self.resolver.resolve(recipient);

        let key = self
            .keystore
            .lookup(&lookup_address)
            .await
            .map_err(|e| RecipientFailure::new(recipient, Stage::Lookup, e))?;

        if let Some(key) = key {
            let encrypt_failure = |e| RecipientFailure::new(recipient, Stage::Encrypt, e);

            if self.keystore.is_expired(&key).await.map_err(encrypt_failure)? {
                return Err(encrypt_failure(Error::KeyExpired(key.id.clone())));
            }

            let plaintext = encode_for_encryption(message);
            let ciphertext = self
                .keystore
                .encrypt(&plaintext, std::slice::from_ref(&key))
                .await
                .map_err(encrypt_failure)?;

            debug!(recipient = %recipient, key = %key, "Message encrypted");
            return Ok(Some((
                DispatchKind::Encrypted,
                build_encrypted_envelope(message, &ciphertext),
            )));
        }

        let action = self.policy.get_action(recipient);
        debug!(recipient = %recipient, action = %action, "No key found, applying policy");

        match action {
            Disposition::Drop => Ok(None),
            Disposition::Cleartext => Ok(Some((DispatchKind::Cleartext, message.clone()))),
            Disposition::Notify => self
                .notifications
                .build(message, recipient)
                .map(|notification| Some((DispatchKind::Notified, notification)))
                .map_err(|e| RecipientFailure::new(recipient, Stage::Policy, e)),
        }
    }

    fn fail(&self, failure: RecipientFailure, aborted: &AtomicBool) -> Outcome {
        if failure.error.is_key_expired() {
            error!(
                recipient = %failure.recipient,
                stage = %failure.stage,
                "Key expired, nothing sent to this recipient"
            );
        } else {
            error!(
                recipient = %failure.recipient,
                stage = %failure.stage,
                code = failure.error.code(),
                "Recipient failed: {}",
                failure.error
            );
        }

        if self.failure_mode == FailureMode::Abort && !aborted.swap(true, Ordering::SeqCst) {
            error!("Aborting remaining recipients after failure of {}", failure.recipient);
        }

        Outcome::Failed(failure)
    }

    fn is_aborted(&self, aborted: &AtomicBool) -> bool {
        self.failure_mode == FailureMode::Abort && aborted.load(Ordering::SeqCst)
    }
}

/// Address of the first `From` mailbox, used as envelope sender
fn envelope_sender(raw: &[u8]) -> Option<String> {
    let parsed = mail_parser::MessageParser::default().parse(raw)?;
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|addr| addr.address())
        .map(|addr| addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cipherpost_common::KeyRef;
    use std::sync::Mutex;

    struct NoKeys;

    #[async_trait]
    impl KeyStore for NoKeys {
        async fn lookup(&self, _address: &str) -> Result<Option<KeyRef>> {
            Ok(None)
        }

        async fn encrypt(&self, _plaintext: &[u8], _keys: &[KeyRef]) -> Result<Vec<u8>> {
            Err(Error::Crypto("no keys".to_string()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Option<String>, Vec<String>)>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn deliver(&self, _message: &[u8], from: Option<&str>, to: &[String]) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((from.map(String::from), to.to_vec()));
            Ok(())
        }
    }

    const RAW: &[u8] = b"From: Sender <sender@example.com>\nTo: a@example.com\nSubject: Hi\n\nbody\n";

    #[test]
    fn test_envelope_sender() {
        assert_eq!(envelope_sender(RAW), Some("sender@example.com".to_string()));
        assert_eq!(envelope_sender(b"Subject: x\n\nbody"), None);
    }

    #[test]
    fn test_marker_value() {
        assert!(marker_value().starts_with("processed by cipherpost v"));
    }

    #[tokio::test]
    async fn test_cleartext_copy_with_marker() {
        let transport = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(Arc::new(NoKeys), transport.clone())
            .with_policy(MissingKeyPolicy::new(vec![crate::policy::PolicyRule::new(
                ".*",
                Disposition::Cleartext,
            )
            .unwrap()]))
            .with_add_header(true);

        let report = pipeline
            .process(RAW, &["a@example.com".to_string()])
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.dispatched.len(), 1);
        let dispatched = &report.dispatched[0];
        assert_eq!(dispatched.kind, DispatchKind::Cleartext);
        assert_eq!(
            dispatched.message.headers.get(MARKER_HEADER),
            Some(marker_value().as_str())
        );
        assert_eq!(dispatched.message.headers.get("Subject"), Some("Hi"));

        let sent = transport.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![(Some("sender@example.com".to_string()), vec!["a@example.com".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_unparseable_message_fails_call() {
        let pipeline = Pipeline::new(Arc::new(NoKeys), Arc::new(Recorder::default()));
        let err = pipeline
            .process(b"not a header line\n\nbody", &["a@example.com".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MIME_ERROR");
    }

    #[test]
    fn test_into_result_returns_first_failure() {
        let report = ProcessReport {
            failures: vec![
                RecipientFailure::new("a@example.com", Stage::Encrypt, Error::KeyExpired("K".into())),
                RecipientFailure::new("b@example.com", Stage::Dispatch, Error::Delivery("x".into())),
            ],
            ..ProcessReport::default()
        };

        let failure = report.into_result().unwrap_err();
        assert_eq!(failure.recipient, "a@example.com");
        assert_eq!(failure.stage, Stage::Encrypt);
        assert_eq!(failure.to_string(), "encrypt failed for a@example.com: Key expired: K");
    }
}
