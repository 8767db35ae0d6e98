//! JSON-RPC 2.0 framing: validate/encode/decode, and the small opaque id
//! types shared by every transport and the Gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Server identifier, as registered in `ServerConfig`.
pub type ServerId = String;

/// A JSON-RPC 2.0 id. Preserves the caller's original JSON type (number or
/// string) through encode/decode round-trips, per spec §4.A.
pub type JsonRpcId = Value;

/// A JSON-RPC 2.0 frame: request, notification, or response. Unknown
/// top-level fields are ignored on decode and dropped on encode (we only
/// ever (de)serialize the fields we model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Which shape a valid frame takes, per spec §4.A / GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Notification,
    Response,
}

impl Frame {
    pub fn kind(&self) -> Result<FrameKind, FrameError> {
        if self.jsonrpc != "2.0" {
            return Err(FrameError::BadVersion);
        }
        let is_response = self.result.is_some() || self.error.is_some();
        let is_request = self.method.is_some();

        match (is_request, is_response) {
            (true, true) => Err(FrameError::AmbiguousShape),
            (true, false) => {
                if self.id.is_some() {
                    Ok(FrameKind::Request)
                } else {
                    Ok(FrameKind::Notification)
                }
            },
            (false, true) => {
                if self.result.is_some() && self.error.is_some() {
                    return Err(FrameError::BothResultAndError);
                }
                if self.id.is_none() {
                    return Err(FrameError::ResponseMissingId);
                }
                Ok(FrameKind::Response)
            },
            (false, false) => Err(FrameError::EmptyFrame),
        }
    }

    pub fn request(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn response_ok(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: Option<JsonRpcId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum FrameError {
    #[error("jsonrpc field must be \"2.0\"")]
    BadVersion,
    #[error("frame has both a method and a result/error")]
    AmbiguousShape,
    #[error("response carries both result and error")]
    BothResultAndError,
    #[error("response frame is missing an id")]
    ResponseMissingId,
    #[error("frame has neither method nor result/error")]
    EmptyFrame,
}

/// `validate(frame) → ok|err` (spec §4.A).
pub fn validate(frame: &Frame) -> Result<FrameKind, FrameError> {
    frame.kind()
}

/// `encode(frame) → bytes`. Validates first; a frame that fails validation
/// is never put on the wire.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    frame.kind()?;
    serde_json::to_vec(frame).map_err(|_| FrameError::EmptyFrame)
}

/// `decode(bytes) → frame|err`.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let frame: Frame = serde_json::from_slice(bytes)?;
    frame.kind().map_err(DecodeError::Invalid)?;
    Ok(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid frame: {0}")]
    Invalid(FrameError),
}

/// Opaque, unique, never-reused connection identifier: `<kind>_<monotonic>_<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn new(kind: &str) -> Self {
        let seq = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        let unique = uuid::Uuid::new_v4().simple();
        Self(format!("{kind}_{seq}_{unique}"))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which adapter a `ServerConfig` should resolve to. `None` means the
/// Transport Registry must detect it (spec §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHint {
    Stdio,
    WebSocket,
    Http,
}

/// A registered MCP server (spec §3 `ServerConfig`). Exactly one of
/// `command` / `url` must be set, depending on the resolved transport:
/// `command` iff stdio, `url` iff websocket/http.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    #[serde(default)]
    pub transport_hint: Option<TransportHint>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl ServerConfig {
    /// Enforces the spec §3 invariant: `command` iff stdio, `url` iff
    /// websocket/http, once the transport kind is known.
    pub fn validate_for(&self, kind: crate::transport::TransportKind) -> Result<(), String> {
        use crate::transport::TransportKind;
        match kind {
            TransportKind::Stdio => {
                if self.command.is_none() {
                    return Err(format!("server {}: stdio transport requires `command`", self.id));
                }
            },
            TransportKind::WebSocket | TransportKind::Http => {
                if self.url.is_none() {
                    return Err(format!("server {}: {kind} transport requires `url`", self.id));
                }
            },
        }
        Ok(())
    }
}

/// Auto-generated JSON-RPC id for requests the caller submitted without one
/// (stdio/WS transports assign these before sending, per spec §4.C/§4.D).
static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn next_auto_id() -> JsonRpcId {
    Value::from(REQUEST_SEQ.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let frame = Frame::request(json!(1), "ping", None);
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.kind().unwrap(), FrameKind::Request);
        assert_eq!(decoded.id, Some(json!(1)));
    }

    #[test]
    fn notification_has_no_id() {
        let frame = Frame::notification("notifications/initialized", None);
        assert_eq!(frame.kind().unwrap(), FrameKind::Notification);
    }

    #[test]
    fn response_requires_result_xor_error() {
        let mut frame = Frame::response_ok(json!(1), json!("pong"));
        assert_eq!(frame.kind().unwrap(), FrameKind::Response);
        frame.error = Some(RpcError {
            code: -1,
            message: "x".into(),
            data: None,
        });
        assert!(matches!(frame.kind(), Err(FrameError::BothResultAndError)));
    }

    #[test]
    fn bad_version_rejected() {
        let frame = Frame {
            jsonrpc: "1.0".to_string(),
            id: Some(json!(1)),
            method: Some("ping".to_string()),
            params: None,
            result: None,
            error: None,
        };
        assert!(matches!(validate(&frame), Err(FrameError::BadVersion)));
    }

    #[test]
    fn string_id_type_preserved() {
        let frame = Frame::request(json!("abc"), "ping", None);
        let bytes = encode(&frame).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.id, Some(json!("abc")));
    }
}
