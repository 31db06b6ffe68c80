//! MQTT wire format.
//!
//! Inbound frames carry `headers.requestId` as the correlation key and an
//! `httpRequest` field holding base64-encoded JSON `{"message": {...}}`.
//! Replies are `API_RESPONSE` frames with an `httpResponse` object.

use super::{
    api_version_from_accept, decode_body, encode_body, headers_from_json, reply_headers_json,
    require_non_empty, CodecError, RequestEnvelope, ResponseEnvelope,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RESPONSE_FRAME_TYPE: &str = "API_RESPONSE";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestFrame {
    #[serde(default)]
    headers: FrameHeaders,
    #[serde(default)]
    http_request: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InnerRequest {
    message: InnerMessage,
}

#[derive(Debug, Deserialize)]
struct InnerMessage {
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
struct ResponseFrame {
    #[serde(rename = "type")]
    frame_type: String,
    headers: FrameHeaders,
    http_response: HttpResponse,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpResponse {
    status_code: u16,
    headers: Map<String, Value>,
    body: String,
}

/// Read just `headers.requestId` from an inbound frame.
pub fn peek_request_id(raw: &[u8]) -> Result<String, CodecError> {
    #[derive(Deserialize)]
    struct Partial {
        #[serde(default)]
        headers: FrameHeaders,
    }
    let partial: Partial = serde_json::from_slice(raw)?;
    require_non_empty("headers.requestId", partial.headers.request_id)
}

pub fn decode_request(raw: &[u8]) -> Result<RequestEnvelope, CodecError> {
    let frame: RequestFrame = serde_json::from_slice(raw)?;
    let request_id = require_non_empty("headers.requestId", frame.headers.request_id)?;
    let encoded = require_non_empty("httpRequest", frame.http_request)?;
    let inner_json = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|source| CodecError::Base64 {
            field: "httpRequest",
            source,
        })?;
    let inner: InnerRequest = serde_json::from_slice(&inner_json)?;
    let message = inner.message;

    let method = require_non_empty("message.method", message.method)?
        .trim()
        .to_ascii_uppercase();
    let path = require_non_empty("message.path", message.path)?.trim().to_string();
    let headers = headers_from_json(message.headers.as_ref());
    let body = decode_body("message.body", message.body.as_deref())?;
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
    let frame = ResponseFrame {
        frame_type: RESPONSE_FRAME_TYPE.to_string(),
        headers: FrameHeaders {
            request_id: Some(response.request_id.clone()),
        },
        http_response: HttpResponse {
            status_code: response.status_code,
            headers: reply_headers_json(response),
            body: encode_body(&response.body),
        },
    };
    Ok(serde_json::to_vec(&frame)?)
}

pub fn decode_reply(raw: &[u8]) -> Result<ResponseEnvelope, CodecError> {
    let frame: ResponseFrame = serde_json::from_slice(raw)?;
    Ok(ResponseEnvelope {
        request_id: frame.headers.request_id.unwrap_or_default(),
        status_code: frame.http_response.status_code,
        headers: headers_from_json(Some(&frame.http_response.headers)),
        body: decode_body("httpResponse.body", Some(&frame.http_response.body))?,
    })
}

/// Build an inbound frame. Used by tests and by tooling that talks to the bus.
pub fn encode_request(request: &RequestEnvelope) -> Result<Vec<u8>, CodecError> {
    let headers: Map<String, Value> = request
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let inner = serde_json::json!({
        "message": {
            "method": request.method,
            "path": request.path,
            "headers": headers,
            "body": encode_body(&request.body),
        }
    });
    let frame = serde_json::json!({
        "type": "API_REQUEST",
        "headers": { "requestId": request.request_id },
        "httpRequest": BASE64.encode(serde_json::to_vec(&inner)?),
    });
    Ok(serde_json::to_vec(&frame)?)
}
