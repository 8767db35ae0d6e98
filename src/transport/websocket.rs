//! WebSocket transport (spec §4.D): full-duplex connections with
//! exponential-backoff-with-jitter reconnect and a bounded outbound queue
//! while disconnected.
//!
//! Grounded on `examples/other_examples` connection-pool's
//! `connection_worker` task (command channel per connection, doubling
//! backoff with a hard cap, `'outer`/inner loop split) extended with the
//! jitter and queue-overflow accounting spec §4.D calls for.

use super::{ConnectionInfo, ConnectionState, MessageHandler, Transport, TransportError, TransportKind};
use crate::types::{self, ConnectionId, Frame};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_FACTOR: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.30;
const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WsServerSpec {
    pub url: String,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WsBackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
}

impl Default for WsBackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            factor: DEFAULT_FACTOR,
            jitter: DEFAULT_JITTER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

enum WsCommand {
    Send(Frame, oneshot::Sender<Frame>),
    /// Enqueue `Frame` for sending with no waiter attached: the caller has
    /// already been acknowledged with `{queued: true}` (spec §4.D), so
    /// whatever response eventually correlates to it is handed to the
    /// connection's `on_message` handler rather than tracked here.
    EnqueueOnly(Frame),
    SendBatch(Vec<Frame>, oneshot::Sender<Vec<Frame>>),
    Close,
}

/// One queue slot: either a frame a caller's `send()` is still waiting on
/// (to be correlated the normal way once it's actually sent), or a
/// fire-and-forget frame queued during a disconnect whose caller already
/// got its `{queued: true}` ack.
enum QueuedFrame {
    WithWaiter(Frame, oneshot::Sender<Frame>),
    FireAndForget(Frame),
}

struct WsConnection {
    server_id: String,
    cmd_tx: mpsc::Sender<WsCommand>,
    state: Arc<parking_lot::Mutex<ConnectionState>>,
    queue_overflow: Arc<AtomicU64>,
    pending_count: Arc<AtomicU64>,
    handler: Arc<parking_lot::Mutex<Option<MessageHandler>>>,
}

pub struct WebSocketTransport {
    server_specs: DashMap<String, WsServerSpec>,
    connections: DashMap<ConnectionId, Arc<WsConnection>>,
    config: WsBackoffConfig,
}

impl WebSocketTransport {
    pub fn new() -> Arc<Self> {
        Self::with_config(WsBackoffConfig::default())
    }

    pub fn with_config(config: WsBackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            server_specs: DashMap::new(),
            connections: DashMap::new(),
            config,
        })
    }

    pub fn register_server(&self, server_id: &str, spec: WsServerSpec) -> Result<(), TransportError> {
        let parsed = url::Url::parse(&spec.url)
            .map_err(|e| TransportError::BadConfig(format!("server {server_id}: bad url: {e}")))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::BadConfig(format!(
                "server {server_id}: url scheme must be ws(s), got {}",
                parsed.scheme()
            )));
        }
        self.server_specs.insert(server_id.to_string(), spec);
        Ok(())
    }

    /// Queue-overflow counter for a connection, exposed for `get_metrics`.
    pub fn queue_overflow_count(&self, conn_id: &ConnectionId) -> u64 {
        self.connections
            .get(conn_id)
            .map(|e| e.value().queue_overflow.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Send several frames as one logical batch (spec §4.D `send_batch`).
    pub async fn send_batch(
        &self,
        conn_id: &ConnectionId,
        frames: Vec<Frame>,
    ) -> Result<Vec<Frame>, TransportError> {
        let conn = self
            .connections
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::NotConnected)?;
        let (tx, rx) = oneshot::channel();
        conn.cmd_tx
            .send(WsCommand::SendBatch(frames, tx))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        tokio::time::timeout(self.config.request_timeout, rx)
            .await
            .map_err(|_| TransportError::RequestTimeout)?
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn create_connection(&self, server_id: &str) -> Result<ConnectionId, TransportError> {
        let spec = self
            .server_specs
            .get(server_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::BadConfig(format!("unregistered server: {server_id}")))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let state = Arc::new(parking_lot::Mutex::new(ConnectionState::Connecting));
        let queue_overflow = Arc::new(AtomicU64::new(0));
        let pending_count = Arc::new(AtomicU64::new(0));
        let handler = Arc::new(parking_lot::Mutex::new(None));

        let conn_id = ConnectionId::new("ws");
        tokio::spawn(connection_worker(
            conn_id.clone(),
            server_id.to_string(),
            spec.url.clone(),
            cmd_rx,
            state.clone(),
            queue_overflow.clone(),
            pending_count.clone(),
            handler.clone(),
            self.config.clone(),
        ));

        self.connections.insert(
            conn_id.clone(),
            Arc::new(WsConnection {
                server_id: server_id.to_string(),
                cmd_tx,
                state,
                queue_overflow,
                pending_count,
                handler,
            }),
        );
        info!(%conn_id, server_id, url = %spec.url, "websocket connection requested");
        Ok(conn_id)
    }

    async fn send(&self, conn_id: &ConnectionId, frame: Frame) -> Result<Frame, TransportError> {
        let conn = self
            .connections
            .get(conn_id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::NotConnected)?;

        frame
            .kind()
            .map_err(|e| TransportError::BadFrame(e.to_string()))?;

        // While the connection isn't up, don't make the caller ride out a
        // whole reconnect cycle: enqueue the frame and acknowledge with
        // `{queued: true}` immediately (spec §4.D scenario S4). The
        // eventual correlated response, once the frame is actually sent
        // and answered, arrives through `on_message` instead of this call.
        if *conn.state.lock() != ConnectionState::Connected {
            let ack_id = frame.id.clone().unwrap_or_else(types::next_auto_id);
            conn.cmd_tx
                .send(WsCommand::EnqueueOnly(frame))
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
            return Ok(Frame::response_ok(ack_id, serde_json::json!({"queued": true})));
        }

        let (tx, rx) = oneshot::channel();
        conn.cmd_tx
            .send(WsCommand::Send(frame, tx))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::RequestTimeout),
        }
    }

    async fn close(&self, conn_id: &ConnectionId) -> Result<(), TransportError> {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return Ok(());
        };
        let _ = conn.cmd_tx.send(WsCommand::Close).await;
        *conn.state.lock() = ConnectionState::Disconnected;
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
            kind: TransportKind::WebSocket,
            state: *conn.state.lock(),
            pending_requests: conn.pending_count.load(Ordering::Relaxed) as usize,
        })
    }

    fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|e| ConnectionInfo {
                id: e.key().clone(),
                server_id: e.value().server_id.clone(),
                kind: TransportKind::WebSocket,
                state: *e.value().state.lock(),
                pending_requests: e.value().pending_count.load(Ordering::Relaxed) as usize,
            })
            .collect()
    }
}

fn next_backoff(current: Duration, config: &WsBackoffConfig) -> Duration {
    let doubled = current.mul_f64(config.factor).min(config.max_delay);
    let jitter_fraction = rand::thread_rng().gen_range(-config.jitter..=config.jitter);
    let jittered_secs = (doubled.as_secs_f64() * (1.0 + jitter_fraction)).max(0.0);
    Duration::from_secs_f64(jittered_secs)
}

async fn connection_worker(
    conn_id: ConnectionId,
    server_id: String,
    url: String,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
    state: Arc<parking_lot::Mutex<ConnectionState>>,
    queue_overflow: Arc<AtomicU64>,
    pending_count: Arc<AtomicU64>,
    handler: Arc<parking_lot::Mutex<Option<MessageHandler>>>,
    config: WsBackoffConfig,
) {
    let mut backoff = config.base_delay;
    let mut outbound_queue: VecDeque<QueuedFrame> = VecDeque::new();
    let mut pending: DashMap<String, oneshot::Sender<Frame>> = DashMap::new();

    'outer: loop {
        *state.lock() = ConnectionState::Connecting;
        let socket = match tokio_tungstenite::connect_async(&url).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!(%conn_id, error = %e, delay = ?backoff, "websocket connect failed, backing off");
                *state.lock() = ConnectionState::Reconnecting;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {},
                    cmd = cmd_rx.recv() => {
                        if matches!(cmd, Some(WsCommand::Close) | None) {
                            break 'outer;
                        }
                        if let Some(cmd) = cmd {
                            enqueue_or_drop(cmd, &mut outbound_queue, &queue_overflow, &config, &server_id);
                        }
                    }
                }
                backoff = next_backoff(backoff, &config);
                continue 'outer;
            },
        };

        info!(%conn_id, "websocket connected");
        *state.lock() = ConnectionState::Connected;
        backoff = config.base_delay;

        let (mut write, mut read) = socket.split();

        // Flush anything queued while disconnected, oldest first.
        while let Some(queued) = outbound_queue.pop_front() {
            match queued {
                QueuedFrame::WithWaiter(frame, waiter) => {
                    if send_frame(&mut write, &frame).await.is_err() {
                        outbound_queue.push_front(QueuedFrame::WithWaiter(frame, waiter));
                        break;
                    }
                    let key = frame.id.as_ref().map(|id| id.to_string());
                    if let Some(key) = key {
                        pending.insert(key, waiter);
                        pending_count.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let _ = waiter.send(Frame::response_ok(
                            types::next_auto_id(),
                            serde_json::json!({"acknowledged": true}),
                        ));
                    }
                },
                QueuedFrame::FireAndForget(frame) => {
                    if send_frame(&mut write, &frame).await.is_err() {
                        outbound_queue.push_front(QueuedFrame::FireAndForget(frame));
                        break;
                    }
                    // Already acknowledged with `{queued: true}` when this
                    // was enqueued; any response is routed to `on_message`
                    // when it arrives, not tracked in `pending`.
                },
            }
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(WsCommand::Close) => break 'outer,
                        Some(WsCommand::Send(frame, waiter)) => {
                            if send_frame(&mut write, &frame).await.is_err() {
                                outbound_queue.push_back(QueuedFrame::WithWaiter(frame, waiter));
                                break;
                            }
                            match frame.id.as_ref().map(|id| id.to_string()) {
                                Some(key) => {
                                    pending.insert(key, waiter);
                                    pending_count.fetch_add(1, Ordering::Relaxed);
                                },
                                None => {
                                    let _ = waiter.send(Frame::response_ok(
                                        types::next_auto_id(),
                                        serde_json::json!({"acknowledged": true}),
                                    ));
                                },
                            }
                        },
                        Some(WsCommand::EnqueueOnly(frame)) => {
                            if send_frame(&mut write, &frame).await.is_err() {
                                outbound_queue.push_back(QueuedFrame::FireAndForget(frame));
                                break;
                            }
                        },
                        Some(WsCommand::SendBatch(frames, waiter)) => {
                            let mut responses = Vec::with_capacity(frames.len());
                            let mut failed = false;
                            for frame in frames {
                                if send_frame(&mut write, &frame).await.is_err() {
                                    failed = true;
                                    break;
                                }
                                responses.push(Frame::response_ok(
                                    frame.id.clone().unwrap_or_else(types::next_auto_id),
                                    serde_json::json!({"sent": true}),
                                ));
                            }
                            if !failed {
                                let _ = waiter.send(responses);
                            }
                        },
                    }
                },
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match types::decode(text.as_bytes()) {
                                Ok(frame) => {
                                    let key = frame.id.as_ref().map(|id| id.to_string());
                                    let correlated = match key {
                                        Some(key) => pending.remove(&key),
                                        None => None,
                                    };
                                    match correlated {
                                        Some((_, waiter)) => {
                                            pending_count.fetch_sub(1, Ordering::Relaxed);
                                            let _ = waiter.send(frame);
                                        },
                                        None => {
                                            // Unsolicited, or a response to a
                                            // frame that was already
                                            // acknowledged with `{queued:
                                            // true}` — surface it instead of
                                            // dropping it on the floor.
                                            let h = handler.lock().clone();
                                            if let Some(h) = h {
                                                h(frame);
                                            }
                                        },
                                    }
                                },
                                Err(e) => debug!(%conn_id, error = %e, "discarding undecodable ws message"),
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(%conn_id, "websocket closed by peer, reconnecting");
                            break;
                        },
                        Some(Ok(_)) => {},
                        Some(Err(e)) => {
                            warn!(%conn_id, error = %e, "websocket read error, reconnecting");
                            break;
                        },
                    }
                },
            }
        }

        // The inner loop only `break`s here on a peer close, read error, or
        // a failed send — never on an explicit `Close`/channel-drop, which
        // exits via `break 'outer` directly. Passing through `Disconnected`
        // before the next `'outer` iteration sets `Connecting` keeps the
        // `Connection` state machine's transitions monotonic (spec §3).
        *state.lock() = ConnectionState::Disconnected;
    }

    *state.lock() = ConnectionState::Disconnected;
    pending.clear();
    info!(%conn_id, "websocket connection worker exiting");
}

fn enqueue_or_drop(
    cmd: WsCommand,
    queue: &mut VecDeque<QueuedFrame>,
    queue_overflow: &Arc<AtomicU64>,
    config: &WsBackoffConfig,
    server_id: &str,
) {
    match cmd {
        WsCommand::Send(frame, waiter) => {
            if queue.len() >= config.queue_capacity {
                queue.pop_front();
                queue_overflow.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_queue_overflow(server_id);
            }
            queue.push_back(QueuedFrame::WithWaiter(frame, waiter));
        },
        WsCommand::EnqueueOnly(frame) => {
            if queue.len() >= config.queue_capacity {
                queue.pop_front();
                queue_overflow.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_queue_overflow(server_id);
            }
            queue.push_back(QueuedFrame::FireAndForget(frame));
        },
        WsCommand::SendBatch(frames, waiter) => {
            // Batches are not individually queueable while disconnected;
            // fail fast so the caller can retry once reconnected.
            let _ = waiter.send(frames.into_iter().map(|_| Frame::response_err(None, -32000, "not connected")).collect());
        },
        WsCommand::Close => {},
    }
}

async fn send_frame<S>(write: &mut S, frame: &Frame) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let bytes = types::encode(frame).map_err(|_| ())?;
    write
        .send(Message::Text(String::from_utf8_lossy(&bytes).to_string()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = WsBackoffConfig {
            jitter: 0.0,
            ..WsBackoffConfig::default()
        };
        let mut delay = config.base_delay;
        for _ in 0..10 {
            delay = next_backoff(delay, &config);
        }
        assert!(delay <= config.max_delay);
    }

    #[test]
    fn backoff_respects_jitter_bounds() {
        let config = WsBackoffConfig::default();
        let next = next_backoff(Duration::from_secs(10), &config);
        let lower = Duration::from_secs_f64(20.0 * (1.0 - config.jitter));
        let upper = Duration::from_secs_f64(20.0 * (1.0 + config.jitter));
        assert!(next >= lower && next <= upper);
    }

    #[tokio::test]
    async fn send_while_disconnected_returns_queued_immediately() {
        // Port 1 never accepts, so the worker stays stuck in
        // Connecting/Reconnecting for far longer than this test runs.
        let transport = WebSocketTransport::with_config(WsBackoffConfig {
            base_delay: Duration::from_secs(30),
            ..WsBackoffConfig::default()
        });
        transport
            .register_server(
                "unreachable",
                WsServerSpec {
                    url: "ws://127.0.0.1:1".to_string(),
                    protocols: vec![],
                },
            )
            .unwrap();
        let conn_id = transport.create_connection("unreachable").await.unwrap();

        let frame = Frame::request(serde_json::json!(1), "ping", None);
        let response = tokio::time::timeout(Duration::from_millis(500), transport.send(&conn_id, frame))
            .await
            .expect("send must return immediately instead of blocking on reconnect")
            .unwrap();
        assert_eq!(response.result.unwrap()["queued"], true);
    }
}
