//! Stdio transport (spec §4.C): one supervised child process per
//! connection, line-delimited JSON-RPC over its stdin/stdout, requests
//! correlated by id with a 30s timeout.
//!
//! Grounded on the teacher's `StdioProcess`/`send_json`/`receive_json`
//! line-protocol handling, generalized to delegate process lifecycle to
//! the Process Supervisor instead of owning the child directly. The
//! teacher's MCP `initialize` handshake (protocol-version negotiation,
//! capability exchange, NPX settle delay) is out of scope here: this
//! transport only frames and correlates JSON-RPC, it does not speak the
//! MCP session-establishment protocol on its callers' behalf.

use super::{ConnectionInfo, ConnectionState, MessageHandler, Transport, TransportError, TransportKind};
use crate::process::{ProcessSupervisor, SpawnConfig};
use crate::types::{self, ConnectionId, Frame};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered stdio server's launch spec (spec §3 `ServerConfig`'s
/// stdio-specific fields).
#[derive(Debug, Clone)]
pub struct StdioServerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

struct StdioConnection {
    server_id: String,
    internal_id: String,
    pending: DashMap<String, oneshot::Sender<Frame>>,
    state: parking_lot::Mutex<ConnectionState>,
    handler: parking_lot::Mutex<Option<MessageHandler>>,
}

/// Adapter managing stdio-backed MCP connections. One instance is shared
/// by every stdio-transport server registered with the Gateway.
pub struct StdioTransport {
    supervisor: Arc<ProcessSupervisor>,
    server_specs: DashMap<String, StdioServerSpec>,
    connections: DashMap<ConnectionId, Arc<StdioConnection>>,
    request_timeout: Duration,
}

impl StdioTransport {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Arc<Self> {
        Self::with_timeout(supervisor, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(supervisor: Arc<ProcessSupervisor>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            server_specs: DashMap::new(),
            connections: DashMap::new(),
            request_timeout,
        })
    }

    /// Register (or replace) the launch spec for `server_id`. The Gateway
    /// calls this once per `ServerConfig` before the first
    /// `create_connection`.
    pub fn register_server(&self, server_id: &str, spec: StdioServerSpec) {
        self.server_specs.insert(server_id.to_string(), spec);
    }

    fn id_key(id: &types::JsonRpcId) -> String {
        id.to_string()
    }

    fn spawn_reader(self: &Arc<Self>, conn_id: ConnectionId, internal_id: String) {
        let Ok(mut rx) = self.supervisor.subscribe_stdout(&internal_id) else {
            warn!(%conn_id, "no stdout subscription available for new connection");
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let line = match rx.recv().await {
                    Ok(line) => line,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Some(conn) = this.connections.get(&conn_id).map(|e| e.value().clone()) else {
                    break;
                };
                match types::decode(line.as_bytes()) {
                    Ok(frame) => this.dispatch_incoming(&conn, frame),
                    Err(e) => {
                        // Non-JSON-RPC lines on stdout (banners, debug
                        // chatter) are discarded, not treated as protocol
                        // errors, per spec §4.C.
                        debug!(%conn_id, error = %e, "discarding undecodable stdout line");
                    },
                }
            }
            if let Some(conn) = this.connections.get(&conn_id) {
                *conn.value().state.lock() = ConnectionState::Disconnected;
            }
        });
    }

    fn dispatch_incoming(&self, conn: &Arc<StdioConnection>, frame: Frame) {
        let key = frame.id.as_ref().map(Self::id_key);
        let correlated = key.and_then(|k| conn.pending.remove(&k));
        match correlated {
            Some((_, tx)) => {
                let _ = tx.send(frame);
            },
            None => {
                // Server-initiated notification/request, or a response to
                // a request nobody is waiting on synchronously: hand it to
                // the registered handler instead of dropping it.
                let handler = conn.handler.lock().clone();
                if let Some(handler) = handler {
                    handler(frame);
                }
            },
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn create_connection(&self, server_id: &str) -> Result<ConnectionId, TransportError> {
        let spec = self
            .server_specs
            .get(server_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::BadConfig(format!("unregistered server: {server_id}")))?;

        // Parent env is inherited by `Command` automatically; we only need
        // to layer the caller-supplied `env` and the `MCP_MODE` hint on
        // top of it (spec §4.C / §6 "Environment").
        let mut env = spec.env.clone();
        env.insert("MCP_MODE".to_string(), "stdio".to_string());

        let internal_id = self
            .supervisor
            .spawn(SpawnConfig {
                command: spec.command.clone(),
                args: spec.args.clone(),
                env,
                working_dir: spec.working_dir.clone(),
                auto_restart: true,
            })
            .await?;

        let conn_id = ConnectionId::new("stdio");
        let connection = Arc::new(StdioConnection {
            server_id: server_id.to_string(),
            internal_id: internal_id.clone(),
            pending: DashMap::new(),
            state: parking_lot::Mutex::new(ConnectionState::Connected),
            handler: parking_lot::Mutex::new(None),
        });
        self.connections.insert(conn_id.clone(), connection);
        info!(%conn_id, server_id, internal_id, "stdio connection established");
        Ok(conn_id)
    }

    async fn send(&self, conn_id: &ConnectionId, mut frame: Frame) -> Result<Frame, TransportError> {
        let conn = self
            .connections
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::NotConnected)?;

        if *conn.state.lock() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let kind = frame
            .kind()
            .map_err(|e| TransportError::BadFrame(e.to_string()))?;

        if kind == types::FrameKind::Notification {
            let bytes = types::encode(&frame).map_err(|e| TransportError::BadFrame(e.to_string()))?;
            let line = String::from_utf8_lossy(&bytes).to_string();
            self.supervisor.send_line(&conn.internal_id, &line).await?;
            return Ok(Frame::response_ok(
                types::next_auto_id(),
                serde_json::json!({"acknowledged": true}),
            ));
        }

        if frame.id.is_none() {
            frame.id = Some(types::next_auto_id());
        }
        let id = frame.id.clone().expect("assigned above");
        let key = Self::id_key(&id);

        let (tx, rx) = oneshot::channel();
        conn.pending.insert(key.clone(), tx);

        let bytes = types::encode(&frame).map_err(|e| TransportError::BadFrame(e.to_string()))?;
        let line = String::from_utf8_lossy(&bytes).to_string();
        if let Err(e) = self.supervisor.send_line(&conn.internal_id, &line).await {
            conn.pending.remove(&key);
            return Err(e.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                conn.pending.remove(&key);
                Err(TransportError::RequestTimeout)
            },
        }
    }

    async fn close(&self, conn_id: &ConnectionId) -> Result<(), TransportError> {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return Ok(());
        };
        *conn.state.lock() = ConnectionState::Disconnected;
        self.supervisor.stop(&conn.internal_id, 1000).await.ok();
        Ok(())
    }

    fn on_message(&self, conn_id: &ConnectionId, handler: MessageHandler) -> Result<(), TransportError> {
        let conn = self
            .connections
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::NotConnected)?;
        *conn.handler.lock() = Some(handler);
        Ok(())
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
            kind: TransportKind::Stdio,
            state: *conn.state.lock(),
            pending_requests: conn.pending.len(),
        })
    }

    fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|e| ConnectionInfo {
                id: e.key().clone(),
                server_id: e.value().server_id.clone(),
                kind: TransportKind::Stdio,
                state: *e.value().state.lock(),
                pending_requests: e.value().pending.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_connection_requires_registration() {
        let supervisor = ProcessSupervisor::new();
        let transport = StdioTransport::new(supervisor);
        let result = transport.create_connection("unregistered").await;
        assert!(matches!(result, Err(TransportError::BadConfig(_))));
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let supervisor = ProcessSupervisor::new();
        let transport = StdioTransport::new(supervisor);
        transport.register_server(
            "cat",
            StdioServerSpec {
                command: "cat".to_string(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
            },
        );
        let conn_id = transport.create_connection("cat").await.unwrap();
        let frame = Frame::request(serde_json::json!(1), "ping", None);
        let response = tokio::time::timeout(Duration::from_secs(2), transport.send(&conn_id, frame)).await;
        // `cat` echoes the request frame back verbatim, which is itself a
        // valid (if unusual) JSON-RPC response shape once matched by id.
        assert!(response.is_ok());
        transport.close(&conn_id).await.unwrap();
    }
}
