//! PGP/MIME canonicalization and envelope construction

use super::content_type::DEFAULT_MIME_TYPE;
use super::message::{Body, Header, Headers, Message, Multipart};
use uuid::Uuid;

const ENVELOPE_PREAMBLE: &str = "This is an OpenPGP/MIME encrypted message (RFC 4880 and 3156)";
const ENVELOPE_CONTENT_TYPE: &str = "multipart/encrypted; protocol=\"application/pgp-encrypted\"";

/// Produce the plaintext that gets encrypted for `message`.
///
/// The result is always a complete multipart MIME document: multipart
/// messages keep their own `Content-Type` and body verbatim, leaf messages
/// are wrapped into a one-part `multipart/mixed` container.
pub fn encode_for_encryption(message: &Message) -> Vec<u8> {
    match &message.body {
        Body::Multipart(_) => {
            let nl = message.newline.as_bytes();
            let mut out = Vec::new();
            match message.headers.field("Content-Type") {
                Some(field) => field.write_to(&mut out, nl),
                None => Header::new("Content-Type", DEFAULT_MIME_TYPE).write_to(&mut out, nl),
            }
            out.extend_from_slice(nl);
            out.extend_from_slice(&message.body_bytes());
            out
        }
        Body::Leaf(body) => {
            let boundary = unique_boundary(body);
            encode_with_boundary(message, body, &boundary)
        }
    }
}

fn encode_with_boundary(message: &Message, body: &[u8], boundary: &str) -> Vec<u8> {
    let mut part_headers = Headers::new();
    match message.headers.field("Content-Type") {
        Some(field) => part_headers.push(field.clone()),
        None => part_headers.append("Content-Type", DEFAULT_MIME_TYPE),
    }
    if let Some(field) = message.headers.field("Content-Transfer-Encoding") {
        part_headers.push(field.clone());
    }
    let part = Message::new(part_headers, Body::Leaf(body.to_vec())).with_newline(message.newline);

    let mut headers = Headers::new();
    headers.append(
        "Content-Type",
        format!("multipart/mixed; boundary=\"{}\"", boundary),
    );

    Message::new(
        headers,
        Body::Multipart(Multipart::new(boundary, vec![part]).with_epilogue(Vec::new())),
    )
    .with_newline(message.newline)
    .to_bytes()
}

/// Build the RFC 3156 `multipart/encrypted` message carrying `ciphertext`.
///
/// All headers of `original` are kept in order except `Content-Type`, which
/// is replaced in place, and `Content-Transfer-Encoding`, which is removed.
pub fn build_encrypted_envelope(original: &Message, ciphertext: &[u8]) -> Message {
    let newline = original.newline;
    let boundary = unique_boundary(ciphertext);

    let mut headers = original.headers.clone();
    headers.remove("Content-Transfer-Encoding");
    headers.set(
        "Content-Type",
        format!("{}; boundary=\"{}\"", ENVELOPE_CONTENT_TYPE, boundary),
    );
    if !headers.contains("MIME-Version") {
        headers.append("MIME-Version", "1.0");
    }

    let mut version_headers = Headers::new();
    version_headers.append("Content-Type", "application/pgp-encrypted");
    version_headers.append("Content-Description", "PGP/MIME version identification");
    let version = Message::new(version_headers, Body::Leaf(b"Version: 1".to_vec()))
        .with_newline(newline);

    let mut payload_headers = Headers::new();
    payload_headers.append("Content-Type", "application/octet-stream; name=\"encrypted.asc\"");
    payload_headers.append("Content-Description", "OpenPGP encrypted message");
    payload_headers.append("Content-Disposition", "inline; filename=\"encrypted.asc\"");
    // The delimiter that follows supplies the final line break
    let armor = ciphertext
        .strip_suffix(b"\r\n")
        .or_else(|| ciphertext.strip_suffix(b"\n"))
        .unwrap_or(ciphertext);
    let payload = Message::new(payload_headers, Body::Leaf(armor.to_vec())).with_newline(newline);

    let multipart = Multipart::new(boundary, vec![version, payload])
        .with_preamble(ENVELOPE_PREAMBLE)
        .with_epilogue(Vec::new());

    Message::new(headers, Body::Multipart(multipart)).with_newline(newline)
}

/// A fresh boundary that does not occur in `content`
pub fn unique_boundary(content: &[u8]) -> String {
    loop {
        let boundary = format!("cipherpost-{}", Uuid::new_v4().simple());
        if !contains(content, boundary.as_bytes()) {
            return boundary;
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
