//! CDP wire envelope for the relay.
//!
//! Every text frame on either leg of the relay is a single JSON object with at
//! most the fields `{id, method, params, result, error, sessionId}`. Binary
//! frames carry opaque recording bytes and have no framing of their own. This
//! crate owns the envelope type, strict decoding with protocol-error
//! classification, the CDP error payloads the relay answers with, and the
//! `tab-<id>` routing tag used on the extension leg.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Browser tab identifier as reported by the extension. Opaque to the relay
/// beyond equality and routing.
pub type TabId = i64;

/// Default upper bound for a single text frame. Large CDP payloads
/// (screenshots, tracing dumps) stay well under this.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// WebSocket close code sent when a peer violates the wire protocol.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// WebSocket close code for frames exceeding the size bound.
pub const CLOSE_TOO_BIG: u16 = 1009;
/// WebSocket close code used when a client exceeds its write-buffer budget.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for unexpected internal failures.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// WebSocket close code used to turn away clients while no extension is
/// connected.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// A single CDP JSON envelope.
///
/// `id` + `method` is a request, `id` alone a response, `method` alone an
/// event. `session_id` routes within a flat-session connection; on the
/// extension leg it carries the `tab-<id>` tag instead of a client session id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CdpError>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Envelope {
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    pub fn response(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn error_response(id: u64, error: CdpError) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn event(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// A caller-issued command: carries both an id and a method.
    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    /// A callee reply: carries an id but no method.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    /// A notification: method without an id.
    pub fn is_event(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }
}

/// CDP error payload, delivered inside a response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CdpError {
    pub code: i64,
    pub message: String,
}

impl CdpError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// No extension link is up and the idle policy rejects the request.
    pub fn extension_unavailable() -> Self {
        Self::new(-32000, "Extension not connected")
    }

    /// The extension link dropped while the request was in flight.
    pub fn extension_disconnected() -> Self {
        Self::new(-32000, "Extension disconnected")
    }

    /// A newer extension connection displaced the one carrying the request.
    pub fn extension_replaced() -> Self {
        Self::new(-32002, "Extension replaced by new connection")
    }

    /// The 30 s extension deadline elapsed without a response.
    pub fn request_timeout() -> Self {
        Self::new(-32000, "Extension request timed out")
    }

    pub fn no_session(session_id: &str) -> Self {
        Self::new(-32001, format!("No session with given id: {session_id}"))
    }

    pub fn no_target(target_id: &str) -> Self {
        Self::new(-32000, format!("No target with given id: {target_id}"))
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(-32000, message)
    }
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cdp error {}: {}", self.code, self.message)
    }
}

/// Violations detected while decoding a text frame.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum WireError {
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    Oversized { size: usize, limit: usize },
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame mixes id and method without params")]
    AmbiguousFrame,
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

impl WireError {
    /// Close code to send when this violation terminates the connection.
    pub fn close_code(&self) -> u16 {
        match self {
            WireError::Oversized { .. } => CLOSE_TOO_BIG,
            WireError::Encode(_) => CLOSE_INTERNAL_ERROR,
            _ => CLOSE_PROTOCOL_ERROR,
        }
    }
}

/// Decode a single text frame into an [`Envelope`].
///
/// Rejects oversized frames, non-object JSON, and frames that carry both an
/// `id` and a `method` while omitting `params` (neither a well-formed request
/// nor a response). No further validation happens at this layer.
pub fn decode(text: &str, max_bytes: usize) -> Result<Envelope, WireError> {
    if text.len() > max_bytes {
        return Err(WireError::Oversized {
            size: text.len(),
            limit: max_bytes,
        });
    }

    let value: Value =
        serde_json::from_str(text).map_err(|err| WireError::InvalidJson(err.to_string()))?;
    if !value.is_object() {
        return Err(WireError::NotAnObject);
    }

    let envelope: Envelope =
        serde_json::from_value(value).map_err(|err| WireError::InvalidJson(err.to_string()))?;

    if envelope.id.is_some() && envelope.method.is_some() && envelope.params.is_none() {
        return Err(WireError::AmbiguousFrame);
    }

    Ok(envelope)
}

pub fn encode(envelope: &Envelope) -> Result<String, WireError> {
    serde_json::to_string(envelope).map_err(|err| WireError::Encode(err.to_string()))
}

/// Routing tag for the extension leg: `tab-<id>` in the `sessionId` slot.
pub fn tab_tag(tab_id: TabId) -> String {
    format!("tab-{tab_id}")
}

pub fn parse_tab_tag(tag: &str) -> Option<TabId> {
    tag.strip_prefix("tab-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_request_response_event() {
        let req = decode(
            r#"{"id":1,"method":"Runtime.evaluate","params":{"expression":"1"},"sessionId":"s1"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("request decodes");
        assert!(req.is_request());
        assert_eq!(req.session_id.as_deref(), Some("s1"));

        let resp = decode(r#"{"id":7,"result":{}}"#, DEFAULT_MAX_FRAME_BYTES).expect("response");
        assert!(resp.is_response());

        let event = decode(
            r#"{"method":"Page.loadEventFired","params":{"timestamp":1.0}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("event");
        assert!(event.is_event());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            decode("not json", DEFAULT_MAX_FRAME_BYTES),
            Err(WireError::InvalidJson(_))
        ));
        assert_eq!(decode("[1,2]", DEFAULT_MAX_FRAME_BYTES), Err(WireError::NotAnObject));
        assert_eq!(
            decode(r#"{"id":1,"method":"Page.enable"}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(WireError::AmbiguousFrame)
        );
        assert_eq!(
            decode("{}", 1),
            Err(WireError::Oversized { size: 2, limit: 1 })
        );
    }

    #[test]
    fn close_codes_match_violation() {
        assert_eq!(
            WireError::Oversized { size: 2, limit: 1 }.close_code(),
            CLOSE_TOO_BIG
        );
        assert_eq!(WireError::NotAnObject.close_code(), CLOSE_PROTOCOL_ERROR);
    }

    #[test]
    fn encode_skips_empty_fields() {
        let text = encode(&Envelope::response(3, json!({}))).expect("encode");
        assert_eq!(text, r#"{"id":3,"result":{}}"#);

        let text = encode(
            &Envelope::event("Target.targetCreated", json!({"targetInfo": {}}))
                .with_session("s2"),
        )
        .expect("encode");
        assert!(text.contains(r#""sessionId":"s2""#));
        assert!(!text.contains("error"));
    }

    #[test]
    fn tab_tags_round_trip() {
        assert_eq!(tab_tag(42), "tab-42");
        assert_eq!(parse_tab_tag("tab-42"), Some(42));
        assert_eq!(parse_tab_tag("s1"), None);
        assert_eq!(parse_tab_tag("tab-"), None);
    }
}
