//! Cipherpost Core - Outbound PGP/MIME encryption gateway
//!
//! This crate decides, per recipient, whether a message can be encrypted,
//! builds the RFC 3156 envelope when it can and applies the missing key
//! policy when it cannot, then hands every result to a transport.

pub mod address;
pub mod crypto;
pub mod delivery;
pub mod mime;
pub mod notification;
pub mod pipeline;
pub mod policy;

pub use address::AliasResolver;
pub use crypto::{build_keystore, GnupgKeyStore, KeyStore};
pub use delivery::{SmtpRelay, Transport};
pub use mime::{Body, ContentType, Header, Headers, Message, Multipart, Newline};
pub use notification::NotificationBuilder;
pub use pipeline::{
    DispatchKind, Dispatched, Pipeline, ProcessReport, RecipientFailure, Stage, MARKER_HEADER,
};
pub use policy::{MissingKeyPolicy, PolicyRule};
