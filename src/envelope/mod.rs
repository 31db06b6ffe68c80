//! Transport-agnostic request/response envelopes and the per-protocol codecs.
//!
//! Both transports carry the same logical HTTP-style exchange. The AMQP
//! flavour sends it as a flat JSON document; the MQTT flavour wraps a
//! base64-encoded JSON request inside an outer JSON frame. Bodies are opaque
//! bytes and travel as base64 text on the wire.

pub mod amqp;
pub mod mqtt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Status code for a request that could not be decoded.
pub const STATUS_BAD_REQUEST: u16 = 400;
/// Status code for the synthesized overload reply.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
/// Body published when a worker pool is saturated.
pub const OVERLOAD_BODY: &str =
    r#"[{"Error":"The server is handling too many requests; please wait and try again."}]"#;

pub const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub const CONTENT_LENGTH_HEADER: &str = "Content-Length";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Wire protocol an envelope is encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Amqp,
    Mqtt,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while converting between wire payloads and envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 in field '{field}': {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),
}

impl CodecError {
    /// Map a decode failure onto the reply the sender should receive.
    pub fn to_response(&self, request_id: &str) -> ResponseEnvelope {
        ResponseEnvelope::error(
            request_id,
            STATUS_BAD_REQUEST,
            format!("Malformed request: {self}"),
        )
    }
}

/// A parsed inbound request. Immutable once produced by a codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// API version requested through the `Accept` header, if any.
    pub api_version: Option<String>,
}

impl RequestEnvelope {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }
}

/// A reply on its way back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn new(request_id: impl Into<String>, status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id: request_id.into(),
            status_code,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Build a JSON response from a serializable value.
    pub fn json(request_id: impl Into<String>, status_code: u16, value: &Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        let mut response = Self::new(request_id, status_code, body);
        response
            .headers
            .insert(CONTENT_TYPE_HEADER.to_string(), JSON_CONTENT_TYPE.to_string());
        response
    }

    /// Error response carrying a `{"message": ...}` body.
    pub fn error(request_id: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self::json(
            request_id,
            status_code,
            &serde_json::json!({ "message": message.into() }),
        )
    }

    /// The fixed 429 reply used when a worker pool is saturated.
    pub fn overloaded(request_id: impl Into<String>) -> Self {
        let mut response = Self::new(request_id, STATUS_TOO_MANY_REQUESTS, OVERLOAD_BODY.as_bytes());
        response
            .headers
            .insert(CONTENT_TYPE_HEADER.to_string(), JSON_CONTENT_TYPE.to_string());
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }
}

/// Decode a raw inbound payload for the given protocol.
pub fn decode(raw: &[u8], protocol: Protocol) -> Result<RequestEnvelope, CodecError> {
    match protocol {
        Protocol::Amqp => amqp::decode_request(raw),
        Protocol::Mqtt => mqtt::decode_request(raw),
    }
}

/// Encode a response into the reply payload for the given protocol.
pub fn encode(response: &ResponseEnvelope, protocol: Protocol) -> Result<Vec<u8>, CodecError> {
    match protocol {
        Protocol::Amqp => amqp::encode_reply(response),
        Protocol::Mqtt => mqtt::encode_reply(response),
    }
}

/// Parse a reply payload produced by [`encode`] back into an envelope.
pub fn decode_reply(raw: &[u8], protocol: Protocol) -> Result<ResponseEnvelope, CodecError> {
    match protocol {
        Protocol::Amqp => amqp::decode_reply(raw),
        Protocol::Mqtt => mqtt::decode_reply(raw),
    }
}

/// Extract `X` from an `Accept: application/...;version=X` header.
pub fn api_version_from_accept(accept: &str) -> Option<String> {
    accept
        .split(';')
        .map(str::trim)
        .find_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("version")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|version| !version.is_empty())
}

fn lookup_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub(crate) fn encode_body(body: &[u8]) -> String {
    BASE64.encode(body)
}

pub(crate) fn decode_body(field: &'static str, text: Option<&str>) -> Result<Vec<u8>, CodecError> {
    match text.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(encoded) => BASE64
            .decode(encoded)
            .map_err(|source| CodecError::Base64 { field, source }),
    }
}

/// Flatten a JSON header object into string values.
pub(crate) fn headers_from_json(headers: Option<&serde_json::Map<String, Value>>) -> BTreeMap<String, String> {
    headers
        .map(|map| {
            map.iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), text)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Reply headers as they go on the wire: handler headers plus a defaulted
/// `Content-Type` and a numeric `Content-Length`.
pub(crate) fn reply_headers_json(response: &ResponseEnvelope) -> serde_json::Map<String, Value> {
    let mut headers = serde_json::Map::new();
    for (key, value) in &response.headers {
        if key.eq_ignore_ascii_case(CONTENT_TYPE_HEADER) || key.eq_ignore_ascii_case(CONTENT_LENGTH_HEADER) {
            continue;
        }
        headers.insert(key.clone(), Value::String(value.clone()));
    }
    let content_type = response
        .header(CONTENT_TYPE_HEADER)
        .unwrap_or(JSON_CONTENT_TYPE)
        .to_string();
    headers.insert(CONTENT_TYPE_HEADER.to_string(), Value::String(content_type));
    headers.insert(
        CONTENT_LENGTH_HEADER.to_string(),
        Value::from(response.body.len()),
    );
    headers
}

/// The value as sent. Blank (all-whitespace) counts as missing.
pub(crate) fn require_non_empty(field: &'static str, value: Option<String>) -> Result<String, CodecError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(CodecError::MissingField(field))
}
