//! MIME message model
//!
//! A [`Message`] is an ordered multimap of headers plus a body that is either
//! raw bytes or a sequence of child messages. Values are never mutated in
//! place by the gateway: every transformation builds a new message.

use super::content_type::ContentType;
use cipherpost_common::{Error, Result};
use std::borrow::Cow;
use tracing::warn;

/// Maximum multipart nesting depth; deeper bodies are kept as raw bytes
const MAX_DEPTH: usize = 64;

/// Line ending used when serializing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Newline {
    #[default]
    Lf,
    CrLf,
}

impl Newline {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Newline::Lf => b"\n",
            Newline::CrLf => b"\r\n",
        }
    }

    /// Guess the line ending from the first line of `raw`
    fn detect(raw: &[u8]) -> Self {
        match raw.iter().position(|&b| b == b'\n') {
            Some(pos) if pos > 0 && raw[pos - 1] == b'\r' => Newline::CrLf,
            _ => Newline::Lf,
        }
    }
}

/// A single header field.
///
/// Parsed fields keep their bytes as received and are written back
/// unchanged. `value` is a decoded view for lookups only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
    raw: Option<Vec<u8>>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            raw: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value without the whitespace after the colon. Continuation lines are
    /// joined with `\n`; bytes that are not UTF-8 show as U+FFFD.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The field as received, from the name up to its final line break
    pub fn raw(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>, nl: &[u8]) {
        match &self.raw {
            Some(raw) => out.extend_from_slice(raw),
            None => {
                out.extend_from_slice(self.name.as_bytes());
                out.extend_from_slice(b": ");
                write_header_value(out, &self.value, nl);
            }
        }
        out.extend_from_slice(nl);
    }
}

/// Ordered header multimap with case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First field named `name`
    pub fn field(&self, name: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// First value of the header `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.field(name).map(Header::value)
    }

    /// Every value of the header `name`, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(Header::value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Append a header after the existing ones
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    /// Append an existing field, keeping its received bytes
    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Remove every occurrence of `name`, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Replace the first occurrence of `name` in place and drop the others,
    /// or append when the header is absent
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let header = Header::new(name, value);

        match self.0.iter().position(|h| h.name.eq_ignore_ascii_case(&header.name)) {
            Some(pos) => {
                let mut index = 0;
                self.0.retain(|h| {
                    let keep = index <= pos || !h.name.eq_ignore_ascii_case(&header.name);
                    index += 1;
                    keep
                });
                self.0[pos] = header;
            }
            None => self.0.push(header),
        }
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Body of a multipart message
///
/// A parsed multipart remembers its body bytes and writes them back
/// verbatim. Taking [`Multipart::parts_mut`] drops them, so later
/// serialization reflects the edited parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multipart {
    boundary: String,
    preamble: Option<Vec<u8>>,
    parts: Vec<Message>,
    epilogue: Option<Vec<u8>>,
    source: Option<Vec<u8>>,
}

/// Message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Leaf(Vec<u8>),
    Multipart(Multipart),
}

/// A MIME message or body part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub headers: Headers,
    pub body: Body,
    pub newline: Newline,
}

impl Multipart {
    /// Create a multipart body without preamble or epilogue
    pub fn new(boundary: impl Into<String>, parts: Vec<Message>) -> Self {
        Self {
            boundary: boundary.into(),
            preamble: None,
            parts,
            epilogue: None,
            source: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<Vec<u8>>) -> Self {
        self.preamble = Some(preamble.into());
        self.source = None;
        self
    }

    pub fn with_epilogue(mut self, epilogue: impl Into<Vec<u8>>) -> Self {
        self.epilogue = Some(epilogue.into());
        self.source = None;
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn preamble(&self) -> Option<&[u8]> {
        self.preamble.as_deref()
    }

    pub fn parts(&self) -> &[Message] {
        &self.parts
    }

    /// Mutable access to the parts; the received bytes are discarded
    pub fn parts_mut(&mut self) -> &mut Vec<Message> {
        self.source = None;
        &mut self.parts
    }

    pub fn epilogue(&self) -> Option<&[u8]> {
        self.epilogue.as_deref()
    }

    /// The received body bytes, for multiparts produced by the parser
    pub fn source(&self) -> Option<&[u8]> {
        self.source.as_deref()
    }

    /// Split `body` on `boundary` delimiter lines. Returns `None` when the
    /// body contains no delimiter at all.
    fn parse(body: &[u8], boundary: &str, depth: usize) -> Option<Self> {
        let delimiters = find_delimiters(body, boundary);
        let first = delimiters.first()?;

        let preamble = if first.line_start == 0 {
            None
        } else {
            Some(strip_line_break(&body[..first.line_start]).to_vec())
        };

        let mut parts = Vec::new();
        let mut epilogue = None;

        for (index, delimiter) in delimiters.iter().enumerate() {
            if delimiter.is_close {
                if delimiter.has_line_break {
                    epilogue = Some(body[delimiter.next_line..].to_vec());
                }
                break;
            }

            let end = match delimiters.get(index + 1) {
                Some(next) => strip_line_break(&body[..next.line_start]).len(),
                None => body.len(),
            };
            let start = delimiter.next_line.min(end);
            let raw_part = &body[start..end];

            let part = match Message::parse_at_depth(raw_part, depth + 1) {
                Ok(part) => part,
                Err(e) => {
                    warn!("Keeping body part {} of '{}' opaque: {}", index + 1, boundary, e);
                    Message::new(Headers::new(), Body::Leaf(raw_part.to_vec()))
                        .with_newline(Newline::detect(raw_part))
                }
            };
            parts.push(part);
        }

        Some(Self {
            boundary: boundary.to_string(),
            preamble,
            parts,
            epilogue,
            source: Some(body.to_vec()),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>, newline: Newline) {
        if let Some(source) = &self.source {
            out.extend_from_slice(source);
            return;
        }

        let nl = newline.as_bytes();

        if let Some(preamble) = &self.preamble {
            out.extend_from_slice(preamble);
            out.extend_from_slice(nl);
        }

        for part in &self.parts {
            out.extend_from_slice(b"--");
            out.extend_from_slice(self.boundary.as_bytes());
            out.extend_from_slice(nl);
            part.write_to(out);
            // The line break before a delimiter belongs to the delimiter
            out.extend_from_slice(nl);
        }

        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--");

        if let Some(epilogue) = &self.epilogue {
            out.extend_from_slice(nl);
            out.extend_from_slice(epilogue);
        }
    }
}

impl Body {
    fn write_to(&self, out: &mut Vec<u8>, newline: Newline) {
        match self {
            Body::Leaf(bytes) => out.extend_from_slice(bytes),
            Body::Multipart(multipart) => multipart.write_to(out, newline),
        }
    }
}

impl Message {
    /// Create a message with LF line endings
    pub fn new(headers: Headers, body: Body) -> Self {
        Self {
            headers,
            body,
            newline: Newline::Lf,
        }
    }

    pub fn with_newline(mut self, newline: Newline) -> Self {
        self.newline = newline;
        self
    }

    /// Parse a complete RFC 5322 / MIME message.
    ///
    /// Only a malformed top-level header block is an error. Body parts whose
    /// headers cannot be parsed are kept as opaque leaves.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Self::parse_at_depth(raw, 0)
    }

    fn parse_at_depth(raw: &[u8], depth: usize) -> Result<Self> {
        let newline = Newline::detect(raw);
        let (header_block, body) = split_header_block(raw);
        let headers = parse_header_block(header_block)?;

        let content_type = headers.get("Content-Type").map(ContentType::parse);
        let body = match content_type {
            Some(ct) if ct.is_multipart() && depth < MAX_DEPTH => match ct.boundary() {
                Some(boundary) => match Multipart::parse(body, boundary, depth) {
                    Some(multipart) => Body::Multipart(multipart),
                    None => {
                        warn!("No '{}' delimiter in {} body, keeping it opaque", boundary, ct.mime_type());
                        Body::Leaf(body.to_vec())
                    }
                },
                None => {
                    warn!("{} body without boundary, keeping it opaque", ct.mime_type());
                    Body::Leaf(body.to_vec())
                }
            },
            _ => Body::Leaf(body.to_vec()),
        };

        Ok(Self {
            headers,
            body,
            newline,
        })
    }

    /// Parsed `Content-Type`, defaulting to `text/plain`
    pub fn content_type(&self) -> ContentType {
        ContentType::parse(self.headers.get("Content-Type").unwrap_or_default())
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self.body, Body::Multipart(_))
    }

    /// Child parts; empty for leaf messages
    pub fn parts(&self) -> &[Message] {
        match &self.body {
            Body::Multipart(multipart) => multipart.parts(),
            Body::Leaf(_) => &[],
        }
    }

    /// Serialized body bytes
    pub fn body_bytes(&self) -> Cow<'_, [u8]> {
        match &self.body {
            Body::Leaf(bytes) => Cow::Borrowed(bytes),
            Body::Multipart(multipart) => match multipart.source() {
                Some(source) => Cow::Borrowed(source),
                None => {
                    let mut out = Vec::new();
                    self.body.write_to(&mut out, self.newline);
                    Cow::Owned(out)
                }
            },
        }
    }

    /// Serialize the full message
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        let nl = self.newline.as_bytes();

        for header in &self.headers {
            header.write_to(out, nl);
        }
        out.extend_from_slice(nl);

        self.body.write_to(out, self.newline);
    }
}

/// Write a header value, converting continuation line breaks to `nl`
pub(crate) fn write_header_value(out: &mut Vec<u8>, value: &str, nl: &[u8]) {
    let mut lines = value.split('\n');
    if let Some(first) = lines.next() {
        out.extend_from_slice(first.as_bytes());
    }
    for line in lines {
        out.extend_from_slice(nl);
        out.extend_from_slice(line.as_bytes());
    }
}

/// Split at the first empty line. Without one, everything is header.
fn split_header_block(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut line_start = 0;

    while line_start < raw.len() {
        let rest = &raw[line_start..];
        if rest.starts_with(b"\r\n") {
            return (&raw[..line_start], &raw[line_start + 2..]);
        }
        if rest.starts_with(b"\n") {
            return (&raw[..line_start], &raw[line_start + 1..]);
        }

        match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => line_start += pos + 1,
            None => break,
        }
    }

    (raw, &[])
}

fn parse_header_block(block: &[u8]) -> Result<Headers> {
    // Each field with the offsets of its first byte and of its last line end
    let mut fields: Vec<(Header, usize, usize)> = Vec::new();
    let mut line_start = 0;

    while line_start < block.len() {
        let (line_end, next_line) = match block[line_start..].iter().position(|&b| b == b'\n') {
            Some(pos) => (line_start + pos, line_start + pos + 1),
            None => (block.len(), block.len()),
        };
        let line = &block[line_start..line_end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let content_end = line_start + line.len();

        if line.starts_with(b" ") || line.starts_with(b"\t") {
            // Continuation of previous header
            let Some((header, _, end)) = fields.last_mut() else {
                return Err(Error::Mime(
                    "Continuation line before the first header".to_string(),
                ));
            };
            header.value.push('\n');
            header.value.push_str(&String::from_utf8_lossy(line));
            *end = content_end;
        } else if let Some(colon_pos) = line.iter().position(|&b| b == b':') {
            let mut name = &line[..colon_pos];
            while let Some(rest) = name.strip_suffix(b" ").or_else(|| name.strip_suffix(b"\t")) {
                name = rest;
            }
            if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
                return Err(Error::Mime(format!(
                    "Invalid header name in line '{}'",
                    String::from_utf8_lossy(line)
                )));
            }
            let value = String::from_utf8_lossy(&line[colon_pos + 1..]);
            let header = Header::new(
                String::from_utf8_lossy(name),
                value.trim_start_matches(|c: char| c == ' ' || c == '\t'),
            );
            fields.push((header, line_start, content_end));
        } else {
            return Err(Error::Mime(format!(
                "Malformed header line '{}'",
                String::from_utf8_lossy(line)
            )));
        }

        line_start = next_line;
    }

    let headers = fields
        .into_iter()
        .map(|(mut header, start, end)| {
            header.raw = Some(block[start..end].to_vec());
            header
        })
        .collect();

    Ok(Headers(headers))
}

/// A boundary delimiter line found in a multipart body
#[derive(Debug)]
struct Delimiter {
    /// Offset of the first byte of the delimiter line
    line_start: usize,
    /// Offset just past the delimiter line and its line break
    next_line: usize,
    has_line_break: bool,
    is_close: bool,
}

fn find_delimiters(body: &[u8], boundary: &str) -> Vec<Delimiter> {
    let marker = format!("--{}", boundary);
    let marker = marker.as_bytes();
    let mut delimiters = Vec::new();
    let mut line_start = 0;

    while line_start < body.len() {
        let (line_end, next_line, has_line_break) =
            match body[line_start..].iter().position(|&b| b == b'\n') {
                Some(pos) => (line_start + pos, line_start + pos + 1, true),
                None => (body.len(), body.len(), false),
            };

        let line = &body[line_start..line_end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if let Some(rest) = line.strip_prefix(marker) {
            let (is_close, padding) = match rest.strip_prefix(b"--") {
                Some(after) => (true, after),
                None => (false, rest),
            };

            // Only linear whitespace may follow a delimiter
            if padding.iter().all(|&b| b == b' ' || b == b'\t') {
                delimiters.push(Delimiter {
                    line_start,
                    next_line,
                    has_line_break,
                    is_close,
                });
                if is_close {
                    break;
                }
            }
        }

        line_start = next_line;
    }

    delimiters
}

/// Drop one trailing line break
fn strip_line_break(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes)
}
