//! HTTP transport (spec §4.F default fallback): a plain request/response
//! adapter backed by a single shared `reqwest::Client`. Connection pooling
//! and keep-alive live in the Transport Optimizer (§4.E), not here — this
//! adapter just issues one POST per frame against the server's `url`.

use super::{ConnectionInfo, ConnectionState, MessageHandler, Transport, TransportError, TransportKind};
use crate::types::{self, ConnectionId, Frame};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpServerSpec {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

struct HttpConnection {
    server_id: String,
    url: String,
    headers: Vec<(String, String)>,
    state: parking_lot::Mutex<ConnectionState>,
    request_count: std::sync::atomic::AtomicU64,
}

/// Adapter for MCP servers reached over plain HTTP. Each "connection" is
/// logical bookkeeping over the shared client; there is no persistent
/// socket to maintain here.
pub struct HttpTransport {
    client: reqwest::Client,
    server_specs: DashMap<String, HttpServerSpec>,
    connections: DashMap<ConnectionId, Arc<HttpConnection>>,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Arc<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            server_specs: DashMap::new(),
            connections: DashMap::new(),
            request_timeout,
        })
    }

    pub fn with_client(client: reqwest::Client, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            server_specs: DashMap::new(),
            connections: DashMap::new(),
            request_timeout,
        })
    }

    /// Registers a server's connection spec, rejecting a `url` that isn't
    /// a valid absolute `http(s)` URL up front rather than failing on the
    /// first `send` (mirrors the teacher's `url::Url::parse` check in its
    /// own HTTP transport).
    pub fn register_server(&self, server_id: &str, spec: HttpServerSpec) -> Result<(), TransportError> {
        let parsed = url::Url::parse(&spec.url)
            .map_err(|e| TransportError::BadConfig(format!("server {server_id}: bad url: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(TransportError::BadConfig(format!(
                "server {server_id}: url scheme must be http(s), got {}",
                parsed.scheme()
            )));
        }
        self.server_specs.insert(server_id.to_string(), spec);
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_connection(&self, server_id: &str) -> Result<ConnectionId, TransportError> {
        let spec = self
            .server_specs
            .get(server_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::BadConfig(format!("unregistered server: {server_id}")))?;

        let conn_id = ConnectionId::new("http");
        self.connections.insert(
            conn_id.clone(),
            Arc::new(HttpConnection {
                server_id: server_id.to_string(),
                url: spec.url,
                headers: spec.headers,
                state: parking_lot::Mutex::new(ConnectionState::Connected),
                request_count: std::sync::atomic::AtomicU64::new(0),
            }),
        );
        Ok(conn_id)
    }

    async fn send(&self, conn_id: &ConnectionId, frame: Frame) -> Result<Frame, TransportError> {
        let conn = self
            .connections
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::NotConnected)?;

        let kind = frame
            .kind()
            .map_err(|e| TransportError::BadFrame(e.to_string()))?;

        let mut request = self.client.post(&conn.url).json(&frame).timeout(self.request_timeout);
        for (name, value) in &conn.headers {
            request = request.header(name, value);
        }

        conn.request_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::RequestTimeout
            } else {
                TransportError::ConnectFailed(e.to_string())
            }
        })?;

        if kind == types::FrameKind::Notification {
            return Ok(Frame::response_ok(
                types::next_auto_id(),
                serde_json::json!({"acknowledged": true}),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        types::decode(&bytes).map_err(|e| TransportError::BadFrame(e.to_string()))
    }

    async fn close(&self, conn_id: &ConnectionId) -> Result<(), TransportError> {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            *conn.state.lock() = ConnectionState::Disconnected;
        }
        Ok(())
    }

    /// HTTP is pure request/response: there is no push channel for a
    /// server to send anything unsolicited on, so the handler is accepted
    /// for interface uniformity but never invoked.
    fn on_message(&self, conn_id: &ConnectionId, _handler: MessageHandler) -> Result<(), TransportError> {
        if self.connections.contains_key(conn_id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn connection_info(&self, conn_id: &ConnectionId) -> Result<ConnectionInfo, TransportError> {
        let conn = self
            .connections
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::NotConnected)?;
        Ok(ConnectionInfo {
            id: conn_id.clone(),
            server_id: conn.server_id.clone(),
            kind: TransportKind::Http,
            state: *conn.state.lock(),
            pending_requests: 0,
        })
    }

    fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|e| ConnectionInfo {
                id: e.key().clone(),
                server_id: e.value().server_id.clone(),
                kind: TransportKind::Http,
                state: *e.value().state.lock(),
                pending_requests: 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_connection_requires_registration() {
        let transport = HttpTransport::new();
        let result = transport.create_connection("unregistered").await;
        assert!(matches!(result, Err(TransportError::BadConfig(_))));
    }
}
