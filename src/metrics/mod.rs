//! Metrics (SPEC_FULL §10.1/§10.2): a small Prometheus registry feeding the
//! Gateway's `get_metrics()` snapshot. Grounded on the teacher's
//! `lazy_static!` + `register_*_vec!` pattern, trimmed to the counters
//! spec §3's `Metrics` shape actually names — request volume, per-transport
//! connection counts, process restarts/resource use, and the WS
//! queue-overflow counter. The teacher's axum scrape handler and
//! `sys_info`-backed `SystemMetricsCollector` have no SPEC_FULL
//! counterpart (no HTTP surface, no extra introspection crate) and are
//! not carried over.

use lazy_static::lazy_static;
use prometheus::{opts, register_counter_vec, register_gauge_vec, CounterVec, GaugeVec, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        opts!("mcp_broker_requests_total", "Total send_request calls handled by the Gateway"),
        &["server_id", "status"]
    )
    .unwrap();

    pub static ref ACTIVE_CONNECTIONS: GaugeVec = register_gauge_vec!(
        opts!("mcp_broker_active_connections", "Currently open connections by transport kind"),
        &["transport"]
    )
    .unwrap();

    pub static ref PROCESS_RESTARTS_TOTAL: CounterVec = register_counter_vec!(
        opts!("mcp_broker_process_restarts_total", "Total process restarts performed by the supervisor"),
        &["server_id"]
    )
    .unwrap();

    pub static ref PROCESS_CPU_PERCENT: GaugeVec = register_gauge_vec!(
        opts!("mcp_broker_process_cpu_percent", "Sampled CPU percent per supervised process"),
        &["internal_id"]
    )
    .unwrap();

    pub static ref PROCESS_MEM_BYTES: GaugeVec = register_gauge_vec!(
        opts!("mcp_broker_process_mem_bytes", "Sampled RSS bytes per supervised process"),
        &["internal_id"]
    )
    .unwrap();

    pub static ref WS_QUEUE_OVERFLOW_TOTAL: CounterVec = register_counter_vec!(
        opts!("mcp_broker_ws_queue_overflow_total", "Frames dropped from a WebSocket outbound queue on overflow"),
        &["server_id"]
    )
    .unwrap();

    pub static ref BATCHES_FLUSHED_TOTAL: CounterVec = register_counter_vec!(
        opts!("mcp_broker_batches_flushed_total", "Batch windows flushed by the transport optimizer"),
        &["server_id"]
    )
    .unwrap();
}

/// Registers every metric above with `REGISTRY`; call once at startup.
pub fn init() {
    let _ = REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_RESTARTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_CPU_PERCENT.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEM_BYTES.clone()));
    let _ = REGISTRY.register(Box::new(WS_QUEUE_OVERFLOW_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BATCHES_FLUSHED_TOTAL.clone()));
}

pub fn record_request(server_id: &str, status: &str) {
    REQUESTS_TOTAL.with_label_values(&[server_id, status]).inc();
}

pub fn set_active_connections(transport: &str, count: i64) {
    ACTIVE_CONNECTIONS
        .with_label_values(&[transport])
        .set(count as f64);
}

pub fn record_restart(server_id: &str) {
    PROCESS_RESTARTS_TOTAL.with_label_values(&[server_id]).inc();
}

pub fn set_process_resources(internal_id: &str, cpu_pct: f64, mem_bytes: u64) {
    PROCESS_CPU_PERCENT
        .with_label_values(&[internal_id])
        .set(cpu_pct);
    PROCESS_MEM_BYTES
        .with_label_values(&[internal_id])
        .set(mem_bytes as f64);
}

pub fn record_queue_overflow(server_id: &str) {
    WS_QUEUE_OVERFLOW_TOTAL.with_label_values(&[server_id]).inc();
}

pub fn record_batch_flush(server_id: &str) {
    BATCHES_FLUSHED_TOTAL.with_label_values(&[server_id]).inc();
}

/// Renders the registry in Prometheus text exposition format. Exposed for
/// the CLI's `metrics` subcommand; there is no HTTP scrape endpoint in
/// this core (spec §1 Non-goals).
pub fn export_text() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_export_round_trips() {
        init();
        record_request("srv", "ok");
        set_active_connections("stdio", 3);
        let text = export_text().unwrap();
        assert!(text.contains("mcp_broker_requests_total"));
        assert!(text.contains("mcp_broker_active_connections"));
    }
}
