//! Transport layer (spec §4.C/§4.D/§4.E/§4.F): a uniform `Transport`
//! contract implemented by the stdio, WebSocket and HTTP adapters, plus
//! the optimizer and registry that sit in front of them.

pub mod http;
pub mod optimizer;
pub mod registry;
pub mod stdio;
pub mod websocket;

use crate::types::{ConnectionId, Frame};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("bad frame: {0}")]
    BadFrame(String),
    #[error("request timeout")]
    RequestTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<crate::process::ProcessError> for TransportError {
    fn from(err: crate::process::ProcessError) -> Self {
        use crate::process::ProcessError as P;
        match err {
            P::BadConfig(msg) => TransportError::BadConfig(msg),
            P::CapacityExceeded => TransportError::CapacityExceeded("process cap reached".into()),
            P::NotFound(id) => TransportError::ConnectFailed(format!("process not found: {id}")),
            P::SpawnFailed(msg) => TransportError::SpawnFailed(msg),
            P::Io(e) => TransportError::Io(e),
        }
    }
}

/// Discriminates the three adapter kinds a `ServerConfig` can resolve to
/// (spec §3 / §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    WebSocket,
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::WebSocket => "websocket",
            TransportKind::Http => "http",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

/// Snapshot of one live connection (spec §3 `Connection`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub server_id: String,
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub pending_requests: usize,
}

/// Callback for frames a connection receives that don't correlate to any
/// pending `send()` call: server-initiated notifications, or a response
/// whose request was already acknowledged via a separate path (spec
/// §4.D's queued-send case). Invoked from the adapter's reader task, so
/// it must not block — hand off to a channel rather than doing work
/// inline.
pub type MessageHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// The uniform adapter contract every transport implements (spec §4
/// preamble: "create_connection / send / close / on_message"). Shared
/// across stdio, WebSocket and HTTP, and wrapped by the registry and
/// optimizer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection to `server_id`, returning its id.
    async fn create_connection(&self, server_id: &str) -> Result<ConnectionId, TransportError>;

    /// Send a request/notification frame on an existing connection and
    /// await the correlated response (notifications resolve immediately
    /// with a synthetic acknowledgement, per spec §4.C).
    async fn send(&self, conn: &ConnectionId, frame: Frame) -> Result<Frame, TransportError>;

    /// Close a connection, releasing any resources it holds.
    async fn close(&self, conn: &ConnectionId) -> Result<(), TransportError>;

    /// Register the handler a connection's reader dispatches unsolicited
    /// frames to (spec §4.C/§4.D "anything else is dispatched to
    /// `on_message`"). Replaces any previously registered handler for
    /// this connection.
    fn on_message(&self, conn: &ConnectionId, handler: MessageHandler) -> Result<(), TransportError>;

    /// Current info for a connection, or an error if unknown.
    fn connection_info(&self, conn: &ConnectionId) -> Result<ConnectionInfo, TransportError>;

    /// All connections currently tracked by this adapter.
    fn list_connections(&self) -> Vec<ConnectionInfo>;
}
