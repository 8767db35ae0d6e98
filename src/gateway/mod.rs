//! Gateway/Router (spec §4.H): the broker's single public surface.
//! `start_server` / `stop_server` / `send_request` / `get_metrics`, plus
//! the supplemented graceful `shutdown` (SPEC_FULL §11). Wires together
//! the Process Supervisor, Transport Registry/Optimizer and Lifecycle
//! Manager; every operation returns a structured error instead of
//! panicking, per spec §7.
//!
//! Grounded on the teacher's `proxy::server::ProxyServer` as the
//! single-entry-point shape, replacing its axum-routed request handling
//! with direct calls into the transport stack.

use crate::config::Config;
use crate::lifecycle::{CleanupEvent, CleanupReason, LifecycleManager};
use crate::metrics;
use crate::process::ProcessSupervisor;
use crate::transport::optimizer::TransportOptimizer;
use crate::transport::registry::TransportRegistry;
use crate::transport::ConnectionInfo;
use crate::types::{ConnectionId, Frame, ServerConfig};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

const SYSTEM_CLIENT: &str = "__gateway__";

#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    pub requests_total: u64,
    pub active_connections: usize,
    pub connections_by_transport: Vec<(String, usize)>,
    pub tracked_servers: usize,
    pub tracked_clients: usize,
}

/// The broker's single public entry point.
pub struct Gateway {
    servers: DashMap<String, ServerConfig>,
    connections: DashMap<String, ConnectionId>,
    process_supervisor: Arc<ProcessSupervisor>,
    registry: Arc<TransportRegistry>,
    optimizer: Arc<TransportOptimizer>,
    lifecycle: Arc<LifecycleManager>,
    requests_total: AtomicU64,
    shutting_down: AtomicBool,
    graceful_terminate_window: Duration,
}

impl Gateway {
    pub fn new(config: &Config) -> (Arc<Self>, mpsc::UnboundedReceiver<CleanupEvent>) {
        let process_supervisor =
            ProcessSupervisor::with_limits(config.process_cap, config.restart_cap, config.restart_delay);
        let mut ws_config: crate::transport::websocket::WsBackoffConfig = (&config.websocket).into();
        ws_config.request_timeout = config.request_timeout;
        let registry =
            TransportRegistry::with_config(process_supervisor.clone(), ws_config, config.request_timeout);
        let optimizer = TransportOptimizer::with_config(
            registry.clone(),
            (&config.batching).into(),
            (&config.http_pool).into(),
        );
        let (lifecycle, cleanup_rx) = LifecycleManager::new(config.idle_timeout, config.cleanup_interval);

        let servers = DashMap::new();
        for server in &config.servers {
            servers.insert(server.id.clone(), server.clone());
            if let Err(e) = registry.register(server) {
                warn!(server_id = %server.id, error = %e, "failed to register server from config");
            }
        }

        let gateway = Arc::new(Self {
            servers,
            connections: DashMap::new(),
            process_supervisor,
            registry,
            optimizer,
            lifecycle,
            requests_total: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            graceful_terminate_window: config.graceful_terminate_window,
        });
        // The cleanup event stream is driven by whoever holds `cleanup_rx`
        // (the CLI's shutdown path) rather than by the Gateway itself.
        (gateway, cleanup_rx)
    }

    /// Register a server at runtime (in addition to the ones loaded from
    /// config at construction time).
    pub fn register_server(&self, config: ServerConfig) -> Result<()> {
        self.registry.register(&config)?;
        self.servers.insert(config.id.clone(), config);
        Ok(())
    }

    /// `start_server(server_id)`: idempotent. Establishes a connection if
    /// one does not already exist.
    #[instrument(skip(self))]
    pub async fn start_server(&self, server_id: &str) -> Result<()> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(Error::Internal("gateway is shutting down".to_string()));
        }
        if self.connections.contains_key(server_id) {
            return Ok(());
        }
        if !self.servers.contains_key(server_id) {
            return Err(Error::UnknownServer(server_id.to_string()));
        }

        let conn_id = self.registry.create_connection(server_id).await?;
        self.connections.insert(server_id.to_string(), conn_id);
        self.lifecycle.register_activity(server_id, SYSTEM_CLIENT).await;
        info!(server_id, "server started");
        Ok(())
    }

    /// `stop_server(server_id)`: idempotent for an already-stopped server,
    /// but a structured `unknown_server` error for an id that was never
    /// registered at all (spec §8 law), mirroring `start_server`'s check.
    #[instrument(skip(self))]
    pub async fn stop_server(&self, server_id: &str) -> Result<()> {
        if !self.servers.contains_key(server_id) {
            return Err(Error::UnknownServer(server_id.to_string()));
        }
        let Some((_, conn_id)) = self.connections.remove(server_id) else {
            return Ok(());
        };
        self.registry.close(server_id, &conn_id).await?;
        self.lifecycle.reap(server_id, CleanupReason::Forced);
        info!(server_id, "server stopped");
        Ok(())
    }

    /// `send_request(server_id, client_id, frame)`: lazily starts the
    /// server if it is not already connected.
    #[instrument(skip(self, frame))]
    pub async fn send_request(&self, server_id: &str, client_id: &str, frame: Frame) -> Result<Frame> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(Error::Internal("gateway is shutting down".to_string()));
        }
        if !self.connections.contains_key(server_id) {
            self.start_server(server_id).await?;
        }
        let conn_id = self
            .connections
            .get(server_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UnknownServer(server_id.to_string()))?;

        self.lifecycle.register_activity(server_id, client_id).await;
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let result = self.optimizer.send(server_id, &conn_id, frame).await;
        metrics::record_request(server_id, if result.is_ok() { "ok" } else { "error" });
        result.map_err(Error::from)
    }

    pub async fn client_disconnected(self: &Arc<Self>, server_id: &str, client_id: &str) {
        self.lifecycle.unregister_client(server_id, client_id).await;
    }

    /// `get_metrics()`: a point-in-time snapshot (spec §3 `Metrics`).
    pub fn get_metrics(&self) -> GatewayMetrics {
        let connections: Vec<ConnectionInfo> = self.registry.list_all_connections();
        let mut by_transport: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for conn in &connections {
            *by_transport.entry(conn.kind.to_string()).or_default() += 1;
        }
        for (transport, count) in &by_transport {
            metrics::set_active_connections(transport, *count as i64);
        }
        let stats = self.lifecycle.stats();
        GatewayMetrics {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            active_connections: connections.len(),
            connections_by_transport: by_transport.into_iter().collect(),
            tracked_servers: stats.tracked_servers,
            tracked_clients: stats.total_clients,
        }
    }

    pub fn list_servers(&self) -> Vec<String> {
        self.servers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn process_supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.process_supervisor
    }

    /// Graceful whole-broker shutdown (SPEC_FULL §11): stop accepting new
    /// activity, wait for in-flight requests up to `grace_period` (capped
    /// at the configured `graceful_terminate_window` floor), then close
    /// every connection and terminate every supervised process.
    pub async fn shutdown(&self, grace_period: Duration) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let grace_period = grace_period.max(self.graceful_terminate_window);
        info!(?grace_period, "gateway shutting down");

        tokio::time::sleep(self.graceful_terminate_window.min(grace_period)).await;

        let server_ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for server_id in server_ids {
            if let Some((_, conn_id)) = self.connections.remove(&server_id) {
                let _ = self.registry.close(&server_id, &conn_id).await;
            }
        }
        self.process_supervisor.kill_all().await;
        info!("gateway shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stdio_config(id: &str) -> Config {
        let mut config = Config::default();
        config.servers.push(ServerConfig {
            id: id.to_string(),
            transport_hint: Some(crate::types::TransportHint::Stdio),
            command: Some("cat".to_string()),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
            url: None,
            protocols: vec![],
        });
        config
    }

    #[tokio::test]
    async fn start_server_is_idempotent() {
        let config = stdio_config("cat-server");
        let (gateway, _rx) = Gateway::new(&config);
        gateway.start_server("cat-server").await.unwrap();
        gateway.start_server("cat-server").await.unwrap();
        assert_eq!(gateway.get_metrics().active_connections, 1);
    }

    #[tokio::test]
    async fn unknown_server_is_structured_error() {
        let config = Config::default();
        let (gateway, _rx) = Gateway::new(&config);
        let result = gateway.start_server("nope").await;
        assert!(matches!(result, Err(Error::UnknownServer(_))));
    }

    #[tokio::test]
    async fn stop_server_is_idempotent() {
        let config = stdio_config("cat-server");
        let (gateway, _rx) = Gateway::new(&config);
        gateway.start_server("cat-server").await.unwrap();
        gateway.stop_server("cat-server").await.unwrap();
        gateway.stop_server("cat-server").await.unwrap();
        assert_eq!(gateway.get_metrics().active_connections, 0);
    }

    #[tokio::test]
    async fn stop_server_on_unregistered_id_is_a_structured_error() {
        let config = Config::default();
        let (gateway, _rx) = Gateway::new(&config);
        let result = gateway.stop_server("nope").await;
        assert!(matches!(result, Err(Error::UnknownServer(_))));
    }
}
