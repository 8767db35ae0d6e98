//! Transport Optimizer (spec §4.E): an HTTP keep-alive pool, a WebSocket
//! reconnect-strategy passthrough, request batching, and the tuning knobs
//! that adjust all three. Sits in front of the Transport Registry; the
//! Gateway talks to this, not to the registry directly.
//!
//! Batching is grounded on the teacher's `batching::BatchAggregator`
//! (size/age flush triggers, per-key pending-request fan-out via oneshot)
//! generalized from `{server_id, method}` keying to per-connection keying,
//! and with its config reconciled into one consistent shape (the teacher
//! had two incompatible `BatchingConfig`s; see DESIGN.md).

use super::registry::TransportRegistry;
use super::{TransportError, TransportKind};
use crate::types::{ConnectionId, Frame, FrameKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpPoolConfig {
    pub keep_alive: Duration,
    pub max_sockets_per_host: usize,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_millis(60_000),
            max_sockets_per_host: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub enabled: bool,
    pub max_batch_size: usize,
    pub max_batch_delay: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 10,
            max_batch_delay: Duration::from_millis(50),
        }
    }
}

/// Runtime-adjustable knobs (spec §4.E "tuning knobs").
#[derive(Debug, Clone)]
pub struct TuningKnobs {
    pub buffer_size: usize,
    pub timeout: Duration,
    pub concurrency: usize,
    pub compression: bool,
}

impl Default for TuningKnobs {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            timeout: Duration::from_secs(30),
            concurrency: 16,
            compression: false,
        }
    }
}

struct PendingEntry {
    frame: Frame,
    waiter: oneshot::Sender<Result<Frame, TransportError>>,
}

struct PendingBatch {
    entries: VecDeque<PendingEntry>,
    flush_scheduled: bool,
}

/// Builds an HTTP client configured for the keep-alive pool described by
/// `HttpPoolConfig`; used when constructing the registry's `HttpTransport`.
pub fn build_pooled_http_client(config: &HttpPoolConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_idle_timeout(config.keep_alive)
        .pool_max_idle_per_host(config.max_sockets_per_host)
        .build()
        .unwrap_or_default()
}

/// Coalesces requests on the same connection into windows bounded by size
/// or age, then forwards each window to the Transport Registry.
pub struct TransportOptimizer {
    registry: Arc<TransportRegistry>,
    batches: dashmap::DashMap<ConnectionId, Arc<AsyncMutex<PendingBatch>>>,
    batching: BatchingConfig,
    http_pool: HttpPoolConfig,
    knobs: parking_lot::RwLock<TuningKnobs>,
    batched_requests_total: AtomicU64,
    batches_flushed_total: AtomicU64,
}

impl TransportOptimizer {
    pub fn new(registry: Arc<TransportRegistry>) -> Arc<Self> {
        Self::with_config(registry, BatchingConfig::default(), HttpPoolConfig::default())
    }

    pub fn with_config(
        registry: Arc<TransportRegistry>,
        batching: BatchingConfig,
        http_pool: HttpPoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            batches: dashmap::DashMap::new(),
            batching,
            http_pool,
            knobs: parking_lot::RwLock::new(TuningKnobs::default()),
            batched_requests_total: AtomicU64::new(0),
            batches_flushed_total: AtomicU64::new(0),
        })
    }

    pub fn tune(&self, knobs: TuningKnobs) {
        *self.knobs.write() = knobs;
    }

    pub fn knobs(&self) -> TuningKnobs {
        self.knobs.read().clone()
    }

    pub fn http_pool_config(&self) -> &HttpPoolConfig {
        &self.http_pool
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.batched_requests_total.load(Ordering::Relaxed),
            self.batches_flushed_total.load(Ordering::Relaxed),
        )
    }

    /// Send one frame through the optimizer. Requests are coalesced into a
    /// batching window when enabled; notifications and responses bypass
    /// batching since there is nothing to coalesce them against.
    pub async fn send(
        &self,
        server_id: &str,
        conn: &ConnectionId,
        frame: Frame,
    ) -> Result<Frame, TransportError> {
        let kind = frame
            .kind()
            .map_err(|e| TransportError::BadFrame(e.to_string()))?;

        if !self.batching.enabled || kind != FrameKind::Request {
            return self.registry.send(server_id, conn, frame).await;
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(server_id.to_string(), conn.clone(), frame, tx)
            .await;
        rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    async fn enqueue(
        &self,
        server_id: String,
        conn: ConnectionId,
        frame: Frame,
        waiter: oneshot::Sender<Result<Frame, TransportError>>,
    ) {
        self.batched_requests_total.fetch_add(1, Ordering::Relaxed);
        let batch = self
            .batches
            .entry(conn.clone())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(PendingBatch {
                    entries: VecDeque::new(),
                    flush_scheduled: false,
                }))
            })
            .clone();

        let should_schedule = {
            let mut guard = batch.lock().await;
            guard.entries.push_back(PendingEntry { frame, waiter });
            if guard.entries.len() >= self.batching.max_batch_size {
                true
            } else if !guard.flush_scheduled {
                guard.flush_scheduled = true;
                true
            } else {
                false
            }
        };

        if should_schedule {
            self.schedule_flush(server_id, conn, batch).await;
        }
    }

    async fn schedule_flush(
        &self,
        server_id: String,
        conn: ConnectionId,
        batch: Arc<AsyncMutex<PendingBatch>>,
    ) {
        let at_capacity = {
            let guard = batch.lock().await;
            guard.entries.len() >= self.batching.max_batch_size
        };
        if !at_capacity {
            tokio::time::sleep(self.batching.max_batch_delay).await;
        }

        let entries: Vec<PendingEntry> = {
            let mut guard = batch.lock().await;
            guard.flush_scheduled = false;
            guard.entries.drain(..).collect()
        };
        if entries.is_empty() {
            return;
        }

        self.batches_flushed_total.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_batch_flush(&server_id);
        debug!(%conn, count = entries.len(), "flushing batch window");

        // WebSocket has a native batch sink (a single `{type:batch,...}`
        // frame); use it instead of falling back to individual sends
        // (spec §4.E).
        if self.registry.kind_of(&server_id).ok() == Some(TransportKind::WebSocket) {
            let frames: Vec<Frame> = entries.iter().map(|e| e.frame.clone()).collect();
            if let Ok(responses) = self.registry.websocket_adapter().send_batch(&conn, frames).await {
                if responses.len() == entries.len() {
                    for (entry, response) in entries.into_iter().zip(responses) {
                        let _ = entry.waiter.send(Ok(response));
                    }
                    return;
                }
            }
            // Native batch send unavailable (connection not up, or a
            // mismatched response count) — fall back to individual sends.
        }

        for entry in entries {
            let result = self.registry.send(&server_id, &conn, entry.frame).await;
            let _ = entry.waiter.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_batching_matches_spec_defaults() {
        let config = BatchingConfig::default();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.max_batch_delay, Duration::from_millis(50));
    }

    #[test]
    fn default_http_pool_matches_spec_defaults() {
        let config = HttpPoolConfig::default();
        assert_eq!(config.keep_alive, Duration::from_millis(60_000));
        assert_eq!(config.max_sockets_per_host, 10);
    }
}
