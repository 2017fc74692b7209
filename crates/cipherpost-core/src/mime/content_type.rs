//! `Content-Type` header values

use mail_parser::{MessageParser, MimeHeaders};

/// Media type used when a part carries no usable `Content-Type`
pub const DEFAULT_MIME_TYPE: &str = "text/plain";

/// A parsed `Content-Type` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    mime_type: String,
    params: Vec<(String, String)>,
}

impl ContentType {
    /// Parse a raw header value. Folded values and RFC 2231 parameter
    /// continuations are accepted; a missing or malformed media type falls
    /// back to `text/plain`.
    pub fn parse(value: &str) -> Self {
        let unfolded = value.replace("\r\n", " ").replace('\n', " ");
        let block = format!("Content-Type: {}\r\n\r\n", unfolded.trim());

        let parsed = MessageParser::default().parse(block.as_bytes());
        let Some(ct) = parsed.as_ref().and_then(|message| message.content_type()) else {
            return Self::default();
        };

        let mime_type = match ct.subtype() {
            Some(subtype) if !ct.ctype().is_empty() && !subtype.is_empty() => {
                format!("{}/{}", ct.ctype(), subtype).to_ascii_lowercase()
            }
            _ => return Self::default(),
        };

        let params = ct
            .attributes()
            .unwrap_or_default()
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
            .collect();

        Self { mime_type, params }
    }

    /// `type/subtype`, lowercase
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The top-level type, e.g. `multipart`
    pub fn main_type(&self) -> &str {
        self.mime_type.split('/').next().unwrap_or_default()
    }

    /// The subtype, e.g. `mixed`
    pub fn sub_type(&self) -> &str {
        self.mime_type.split('/').nth(1).unwrap_or_default()
    }

    pub fn is_multipart(&self) -> bool {
        self.main_type() == "multipart"
    }

    /// Look up a parameter by case-insensitive name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The `boundary` parameter, when present and non-empty
    pub fn boundary(&self) -> Option<&str> {
        self.param("boundary").filter(|b| !b.is_empty())
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self {
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            params: Vec::new(),
        }
    }
}
