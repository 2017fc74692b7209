//! MIME message handling
//!
//! Parsing and serialization of messages, plus the PGP/MIME transforms
//! applied on the encryption path.

mod content_type;
mod message;
mod transform;

pub use content_type::{ContentType, DEFAULT_MIME_TYPE};
pub use message::{Body, Header, Headers, Message, Multipart, Newline};
pub use transform::{build_encrypted_envelope, encode_for_encryption, unique_boundary};
