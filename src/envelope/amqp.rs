//! AMQP wire format.
//!
//! Inbound: `{"id", "method", "path" | "requestUri", "headers", "body"}` with a
//! base64 body. Outbound: `{"id", "headers", "statusCode", "body", "request": false}`.

use super::{
    api_version_from_accept, decode_body, encode_body, headers_from_json, reply_headers_json,
    require_non_empty, CodecError, RequestEnvelope, ResponseEnvelope,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
struct RequestIdOnly {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, alias = "requestUri")]
    path: Option<String>,
    #[serde(default)]
    headers: Option<Map<String, Value>>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReply {
    id: String,
    headers: Map<String, Value>,
    status_code: u16,
    body: String,
    request: bool,
}

/// Read just the correlation id, without validating the rest of the payload.
pub fn peek_request_id(raw: &[u8]) -> Result<String, CodecError> {
    let partial: RequestIdOnly = serde_json::from_slice(raw)?;
    require_non_empty("id", partial.id)
}

pub fn decode_request(raw: &[u8]) -> Result<RequestEnvelope, CodecError> {
    let wire: WireRequest = serde_json::from_slice(raw)?;
    let request_id = require_non_empty("id", wire.id)?;
    let method = require_non_empty("method", wire.method)?
        .trim()
        .to_ascii_uppercase();
    let path = require_non_empty("path", wire.path)?.trim().to_string();
    let headers = headers_from_json(wire.headers.as_ref());
    let body = decode_body("body", wire.body.as_deref())?;
    let api_version = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Accept"))
        .and_then(|(_, accept)| api_version_from_accept(accept));

    Ok(RequestEnvelope {
        request_id,
        method,
        path,
        headers,
        body,
        api_version,
    })
}

pub fn encode_reply(response: &ResponseEnvelope) -> Result<Vec<u8>, CodecError> {
    let wire = WireReply {
        id: response.request_id.clone(),
        headers: reply_headers_json(response),
        status_code: response.status_code,
        body: encode_body(&response.body),
        request: false,
    };
    Ok(serde_json::to_vec(&wire)?)
}

pub fn decode_reply(raw: &[u8]) -> Result<ResponseEnvelope, CodecError> {
    let wire: WireReply = serde_json::from_slice(raw)?;
    Ok(ResponseEnvelope {
        request_id: wire.id,
        status_code: wire.status_code,
        headers: headers_from_json(Some(&wire.headers)),
        body: decode_body("body", Some(&wire.body))?,
    })
}
