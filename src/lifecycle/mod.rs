//! Lifecycle Manager (spec §4.G): tracks which clients are using which
//! server, and tears a server down after it has had no clients for
//! `idle_timeout`. A one-shot scheduled handle does the common case;
//! a periodic sweep is the safety net for anything the handle misses.

use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown server: {0}")]
    UnknownServer(String),
}

/// Emitted on the cleanup stream when a server is torn down (spec §4.G
/// "cleanup event").
#[derive(Debug, Clone)]
pub struct CleanupEvent {
    pub server_id: String,
    pub reason: CleanupReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    Idle,
    Forced,
}

struct ServerSlot {
    clients: DashSet<String>,
    last_activity: parking_lot::Mutex<Instant>,
    cleanup_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ServerSlot {
    fn new() -> Self {
        Self {
            clients: DashSet::new(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            cleanup_handle: AsyncMutex::new(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleStats {
    pub tracked_servers: usize,
    pub total_clients: usize,
    pub idle_timeout: Duration,
}

/// Shared across the Gateway; owns one `ServerSlot` per active server id.
pub struct LifecycleManager {
    slots: Arc<DashMap<String, Arc<ServerSlot>>>,
    idle_timeout: Duration,
    cleanup_tx: mpsc::UnboundedSender<CleanupEvent>,
    cleanups_total: AtomicU64,
}

impl LifecycleManager {
    pub fn new(idle_timeout: Duration, cleanup_interval: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<CleanupEvent>) {
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            slots: Arc::new(DashMap::new()),
            idle_timeout,
            cleanup_tx,
            cleanups_total: AtomicU64::new(0),
        });
        manager.clone().spawn_sweeper(cleanup_interval);
        (manager, cleanup_rx)
    }

    fn slot(&self, server_id: &str) -> Arc<ServerSlot> {
        self.slots
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(ServerSlot::new()))
            .clone()
    }

    /// Record activity from `client_id` against `server_id`: adds the
    /// client, bumps `last_activity`, and cancels any scheduled cleanup.
    pub async fn register_activity(&self, server_id: &str, client_id: &str) {
        let slot = self.slot(server_id);
        slot.clients.insert(client_id.to_string());
        *slot.last_activity.lock() = Instant::now();
        let mut handle_guard = slot.cleanup_handle.lock().await;
        if let Some(handle) = handle_guard.take() {
            handle.abort();
        }
    }

    /// Remove `client_id` from `server_id`'s slot. If this was the last
    /// client, schedule a cleanup after `idle_timeout` (cancelable by a
    /// subsequent `register_activity`).
    pub async fn unregister_client(self: &Arc<Self>, server_id: &str, client_id: &str) {
        let Some(slot) = self.slots.get(server_id).map(|e| e.value().clone()) else {
            return;
        };
        slot.clients.remove(client_id);
        *slot.last_activity.lock() = Instant::now();

        if !slot.clients.is_empty() {
            return;
        }

        let manager = self.clone();
        let server_id = server_id.to_string();
        let idle_timeout = self.idle_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            manager.reap(&server_id, CleanupReason::Idle);
        });

        let mut handle_guard = slot.cleanup_handle.lock().await;
        if let Some(previous) = handle_guard.replace(handle) {
            previous.abort();
        }
    }

    /// True if `server_id` currently has at least one registered client.
    pub fn should_keep_alive(&self, server_id: &str) -> bool {
        self.slots
            .get(server_id)
            .map(|e| !e.value().clients.is_empty())
            .unwrap_or(false)
    }

    /// Tear down `server_id` immediately, regardless of client count, and
    /// emit a cleanup event. Idempotent: cleaning up an already-removed
    /// slot is a no-op.
    pub fn reap(&self, server_id: &str, reason: CleanupReason) {
        if self.slots.remove(server_id).is_none() {
            return;
        }
        self.cleanups_total.fetch_add(1, Ordering::Relaxed);
        info!(server_id, ?reason, "lifecycle cleanup");
        let _ = self.cleanup_tx.send(CleanupEvent {
            server_id: server_id.to_string(),
            reason,
        });
    }

    /// `force_cleanup() → int` (spec §4.G): an on-demand sweep of every
    /// slot currently eligible for idle cleanup (no clients, idle for at
    /// least `idle_timeout`), run immediately rather than waiting on the
    /// periodic sweeper or a per-slot scheduled handle. Returns how many
    /// slots were reaped.
    pub fn force_cleanup(&self) -> usize {
        let idle_timeout = self.idle_timeout;
        let stale: Vec<String> = self
            .slots
            .iter()
            .filter(|e| {
                let slot = e.value();
                slot.clients.is_empty() && slot.last_activity.lock().elapsed() >= idle_timeout
            })
            .map(|e| e.key().clone())
            .collect();
        let count = stale.len();
        for server_id in stale {
            self.reap(&server_id, CleanupReason::Idle);
        }
        count
    }

    pub fn stats(&self) -> LifecycleStats {
        let total_clients = self.slots.iter().map(|e| e.value().clients.len()).sum();
        LifecycleStats {
            tracked_servers: self.slots.len(),
            total_clients,
            idle_timeout: self.idle_timeout,
        }
    }

    pub fn client_counts(&self) -> HashMap<String, usize> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clients.len()))
            .collect()
    }

    fn spawn_sweeper(self: Arc<Self>, cleanup_interval: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                interval.tick().await;
                let idle_timeout = self.idle_timeout;
                let stale: Vec<String> = self
                    .slots
                    .iter()
                    .filter(|e| {
                        let slot = e.value();
                        slot.clients.is_empty() && slot.last_activity.lock().elapsed() >= idle_timeout
                    })
                    .map(|e| e.key().clone())
                    .collect();
                for server_id in stale {
                    debug!(server_id, "sweeper catching missed idle cleanup");
                    self.reap(&server_id, CleanupReason::Idle);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activity_keeps_server_alive() {
        let (manager, _rx) = LifecycleManager::new(Duration::from_millis(50), Duration::from_secs(60));
        manager.register_activity("srv", "client-1").await;
        assert!(manager.should_keep_alive("srv"));
    }

    #[tokio::test]
    async fn unregister_last_client_schedules_cleanup() {
        let (manager, mut rx) = LifecycleManager::new(Duration::from_millis(20), Duration::from_secs(60));
        manager.register_activity("srv", "client-1").await;
        manager.unregister_client("srv", "client-1").await;
        assert!(!manager.should_keep_alive("srv"));

        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("cleanup event should fire")
            .expect("channel open");
        assert_eq!(event.server_id, "srv");
        assert_eq!(event.reason, CleanupReason::Idle);
    }

    #[tokio::test]
    async fn reactivation_cancels_scheduled_cleanup() {
        let (manager, mut rx) = LifecycleManager::new(Duration::from_millis(50), Duration::from_secs(60));
        manager.register_activity("srv", "client-1").await;
        manager.unregister_client("srv", "client-1").await;
        manager.register_activity("srv", "client-2").await;

        let result = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(result.is_err(), "cleanup should not fire after reactivation");
        assert!(manager.should_keep_alive("srv"));
    }

    #[tokio::test]
    async fn reap_is_idempotent() {
        let (manager, _rx) = LifecycleManager::new(Duration::from_secs(1), Duration::from_secs(60));
        manager.reap("absent", CleanupReason::Forced);
    }

    #[tokio::test]
    async fn force_cleanup_sweeps_only_idle_eligible_slots() {
        let (manager, _rx) = LifecycleManager::new(Duration::from_millis(20), Duration::from_secs(60));
        manager.register_activity("idle-candidate", "client-1").await;
        manager.unregister_client("idle-candidate", "client-1").await;
        manager.register_activity("still-active", "client-2").await;

        // Not yet idle_timeout old: nothing eligible yet.
        assert_eq!(manager.force_cleanup(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(manager.force_cleanup(), 1);
        assert!(manager.should_keep_alive("still-active"));
        assert!(!manager.should_keep_alive("idle-candidate"));
    }
}
