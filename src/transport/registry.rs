//! Transport Registry (spec §4.F): resolves each `ServerConfig` to a
//! transport kind and hands out the right adapter, keyed by server id.

use super::http::{HttpServerSpec, HttpTransport};
use super::stdio::{StdioServerSpec, StdioTransport};
use super::websocket::{WsBackoffConfig, WsServerSpec, WebSocketTransport};
use super::{ConnectionInfo, Transport, TransportError, TransportKind};
use crate::process::ProcessSupervisor;
use crate::types::{ConnectionId, Frame, ServerConfig, TransportHint};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Precedence for resolving a server's transport kind when no explicit
/// hint is set (spec §4.F): explicit hint → `MCP_MODE` env var →
/// package-name heuristic on `command` → id-prefix heuristic → default
/// http.
pub fn detect_kind(config: &ServerConfig) -> TransportKind {
    if let Some(hint) = config.transport_hint {
        return match hint {
            TransportHint::Stdio => TransportKind::Stdio,
            TransportHint::WebSocket => TransportKind::WebSocket,
            TransportHint::Http => TransportKind::Http,
        };
    }

    if let Ok(mode) = std::env::var("MCP_MODE") {
        match mode.to_ascii_lowercase().as_str() {
            "stdio" => return TransportKind::Stdio,
            "websocket" | "ws" => return TransportKind::WebSocket,
            "http" => return TransportKind::Http,
            _ => {},
        }
    }

    if let Some(command) = &config.command {
        let base = command.rsplit('/').next().unwrap_or(command);
        if matches!(base, "npx" | "node" | "python" | "python3" | "uvx" | "uv") {
            return TransportKind::Stdio;
        }
    }

    if config.id.starts_with("ws:") || config.id.starts_with("ws_") || config.id.starts_with("ws-") {
        return TransportKind::WebSocket;
    }
    if config.id.starts_with("stdio:") || config.id.starts_with("stdio_") || config.id.starts_with("stdio-") {
        return TransportKind::Stdio;
    }

    TransportKind::Http
}

/// Holds one singleton adapter per kind and routes `ServerConfig`
/// registrations/connections to the right one.
pub struct TransportRegistry {
    stdio: Arc<StdioTransport>,
    websocket: Arc<WebSocketTransport>,
    http: Arc<HttpTransport>,
    server_kinds: DashMap<String, TransportKind>,
}

impl TransportRegistry {
    pub fn new(process_supervisor: Arc<ProcessSupervisor>) -> Arc<Self> {
        Self::with_config(process_supervisor, WsBackoffConfig::default(), WsBackoffConfig::default().request_timeout)
    }

    /// Build a registry whose adapters honour the broker-wide
    /// `request_timeout` and WebSocket backoff knobs from `Config`
    /// (spec §6), instead of each adapter's built-in defaults.
    pub fn with_config(
        process_supervisor: Arc<ProcessSupervisor>,
        ws_config: WsBackoffConfig,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            stdio: StdioTransport::with_timeout(process_supervisor, request_timeout),
            websocket: WebSocketTransport::with_config(ws_config),
            http: HttpTransport::with_timeout(request_timeout),
            server_kinds: DashMap::new(),
        })
    }

    /// Register a server, resolving and remembering its transport kind.
    /// Returns an error if the resolved kind's required field is absent
    /// (spec §3 invariant).
    pub fn register(&self, config: &ServerConfig) -> Result<TransportKind, TransportError> {
        let kind = detect_kind(config);
        config
            .validate_for(kind)
            .map_err(TransportError::BadConfig)?;

        match kind {
            TransportKind::Stdio => self.stdio.register_server(
                &config.id,
                StdioServerSpec {
                    command: config.command.clone().expect("validated above"),
                    args: config.args.clone(),
                    env: config.env.clone(),
                    working_dir: config.working_dir.clone(),
                },
            ),
            TransportKind::WebSocket => self.websocket.register_server(
                &config.id,
                WsServerSpec {
                    url: config.url.clone().expect("validated above"),
                    protocols: config.protocols.clone(),
                },
            )?,
            TransportKind::Http => self.http.register_server(
                &config.id,
                HttpServerSpec {
                    url: config.url.clone().expect("validated above"),
                    headers: vec![],
                },
            )?,
        }

        self.server_kinds.insert(config.id.clone(), kind);
        Ok(kind)
    }

    pub fn kind_of(&self, server_id: &str) -> Result<TransportKind, TransportError> {
        self.server_kinds
            .get(server_id)
            .map(|e| *e.value())
            .ok_or_else(|| TransportError::BadConfig(format!("unregistered server: {server_id}")))
    }

    pub async fn create_connection(&self, server_id: &str) -> Result<ConnectionId, TransportError> {
        match self.kind_of(server_id)? {
            TransportKind::Stdio => self.stdio.create_connection(server_id).await,
            TransportKind::WebSocket => self.websocket.create_connection(server_id).await,
            TransportKind::Http => self.http.create_connection(server_id).await,
        }
    }

    pub async fn send(&self, server_id: &str, conn: &ConnectionId, frame: Frame) -> Result<Frame, TransportError> {
        match self.kind_of(server_id)? {
            TransportKind::Stdio => self.stdio.send(conn, frame).await,
            TransportKind::WebSocket => self.websocket.send(conn, frame).await,
            TransportKind::Http => self.http.send(conn, frame).await,
        }
    }

    pub async fn close(&self, server_id: &str, conn: &ConnectionId) -> Result<(), TransportError> {
        match self.kind_of(server_id)? {
            TransportKind::Stdio => self.stdio.close(conn).await,
            TransportKind::WebSocket => self.websocket.close(conn).await,
            TransportKind::Http => self.http.close(conn).await,
        }
    }

    pub fn on_message(
        &self,
        server_id: &str,
        conn: &ConnectionId,
        handler: super::MessageHandler,
    ) -> Result<(), TransportError> {
        match self.kind_of(server_id)? {
            TransportKind::Stdio => self.stdio.on_message(conn, handler),
            TransportKind::WebSocket => self.websocket.on_message(conn, handler),
            TransportKind::Http => self.http.on_message(conn, handler),
        }
    }

    pub fn connection_info(&self, server_id: &str, conn: &ConnectionId) -> Result<ConnectionInfo, TransportError> {
        match self.kind_of(server_id)? {
            TransportKind::Stdio => self.stdio.connection_info(conn),
            TransportKind::WebSocket => self.websocket.connection_info(conn),
            TransportKind::Http => self.http.connection_info(conn),
        }
    }

    pub fn list_all_connections(&self) -> Vec<ConnectionInfo> {
        let mut all = self.stdio.list_connections();
        all.extend(self.websocket.list_connections());
        all.extend(self.http.list_connections());
        all
    }

    pub fn websocket_adapter(&self) -> &Arc<WebSocketTransport> {
        &self.websocket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(id: &str, command: Option<&str>, url: Option<&str>, hint: Option<TransportHint>) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            transport_hint: hint,
            command: command.map(|s| s.to_string()),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
            url: url.map(|s| s.to_string()),
            protocols: vec![],
        }
    }

    #[test]
    fn explicit_hint_wins() {
        let cfg = config("a", Some("node"), Some("http://x"), Some(TransportHint::Http));
        assert_eq!(detect_kind(&cfg), TransportKind::Http);
    }

    #[test]
    fn package_name_heuristic_detects_stdio() {
        let cfg = config("b", Some("npx"), None, None);
        assert_eq!(detect_kind(&cfg), TransportKind::Stdio);
    }

    #[test]
    fn id_prefix_heuristic_detects_websocket_even_with_an_http_url() {
        // The id-prefix heuristic (step 4) must win over whatever scheme
        // `url` happens to carry, since url scheme isn't part of the
        // precedence at all.
        let cfg = config("ws-svc", None, Some("http://x"), None);
        assert_eq!(detect_kind(&cfg), TransportKind::WebSocket);
    }

    #[test]
    fn id_prefix_heuristic_detects_stdio() {
        let cfg = config("stdio-svc", None, None, None);
        assert_eq!(detect_kind(&cfg), TransportKind::Stdio);
    }

    #[test]
    fn falls_back_to_http() {
        let cfg = config("d", None, None, None);
        assert_eq!(detect_kind(&cfg), TransportKind::Http);
    }
}
