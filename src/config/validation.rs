//! Config validation: enforces the spec §3 `ServerConfig` invariant
//! (`command` required iff stdio, `url` required iff websocket/http) plus
//! sane bounds on the broker-wide knobs.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::registry::detect_kind;
use std::time::Duration;

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.process_cap == 0 {
            return Err(Error::BadConfig("process_cap must be non-zero".to_string()));
        }
        if self.restart_cap == 0 {
            return Err(Error::BadConfig("restart_cap must be non-zero".to_string()));
        }
        if self.request_timeout == Duration::ZERO {
            return Err(Error::BadConfig("request_timeout must be non-zero".to_string()));
        }
        if self.websocket.jitter < 0.0 || self.websocket.jitter > 1.0 {
            return Err(Error::BadConfig("websocket.jitter must be within [0, 1]".to_string()));
        }
        if self.websocket.base_delay > self.websocket.max_delay {
            return Err(Error::BadConfig(
                "websocket.base_delay must not exceed websocket.max_delay".to_string(),
            ));
        }
        if self.batching.enabled && self.batching.max_batch_size == 0 {
            return Err(Error::BadConfig(
                "batching.max_batch_size must be non-zero when batching is enabled".to_string(),
            ));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return Err(Error::BadConfig("server id must not be empty".to_string()));
            }
            if !seen_ids.insert(server.id.clone()) {
                return Err(Error::BadConfig(format!("duplicate server id: {}", server.id)));
            }
            let kind = detect_kind(server);
            server.validate_for(kind).map_err(Error::BadConfig)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerConfig;

    fn stdio_server(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            transport_hint: Some(crate::types::TransportHint::Stdio),
            command: Some("echo".to_string()),
            args: vec![],
            env: Default::default(),
            working_dir: None,
            url: None,
            protocols: vec![],
        }
    }

    #[test]
    fn valid_config_passes() {
        let mut config = Config::default();
        config.servers.push(stdio_server("a"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut config = Config::default();
        config.servers.push(stdio_server("a"));
        config.servers.push(stdio_server("a"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_process_cap() {
        let mut config = Config::default();
        config.process_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_stdio_server_without_command() {
        let mut config = Config::default();
        let mut server = stdio_server("a");
        server.command = None;
        config.servers.push(server);
        assert!(config.validate().is_err());
    }
}
