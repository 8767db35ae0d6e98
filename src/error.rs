//! Error types for mcp-broker

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error kinds, matching the broker's structured error vocabulary.
///
/// Every variant here is returned to callers as a value, never raised as a
/// panic; the Gateway attaches `server_id`/`connection_id` context when it
/// surfaces one of these (see `gateway::GatewayError`).
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad config: {0}")]
    BadConfig(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

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

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable string tag for the error kind, used in structured responses
    /// returned over the control API (see spec §7).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BadConfig(_) => "bad_config",
            Error::CapacityExceeded(_) => "capacity_exceeded",
            Error::SpawnFailed(_) => "spawn_failed",
            Error::ConnectFailed(_) => "connect_failed",
            Error::BadFrame(_) => "bad_frame",
            Error::RequestTimeout => "request_timeout",
            Error::ConnectionClosed => "connection_closed",
            Error::NotConnected => "not_connected",
            Error::UnknownServer(_) => "unknown_server",
            Error::NotFound(_) => "not_found",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Toml(_) => "toml",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(_) | Error::RequestTimeout | Error::NotConnected
        )
    }
}

impl From<crate::transport::TransportError> for Error {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError as T;
        match err {
            T::BadConfig(msg) => Error::BadConfig(msg),
            T::SpawnFailed(msg) => Error::SpawnFailed(msg),
            T::ConnectFailed(msg) => Error::ConnectFailed(msg),
            T::BadFrame(msg) => Error::BadFrame(msg),
            T::RequestTimeout => Error::RequestTimeout,
            T::ConnectionClosed => Error::ConnectionClosed,
            T::NotConnected => Error::NotConnected,
            T::CapacityExceeded(msg) => Error::CapacityExceeded(msg),
            T::Io(e) => Error::Io(e),
            T::Json(e) => Error::Json(e),
        }
    }
}

impl From<crate::process::ProcessError> for Error {
    fn from(err: crate::process::ProcessError) -> Self {
        use crate::process::ProcessError as P;
        match err {
            P::BadConfig(msg) => Error::BadConfig(msg),
            P::CapacityExceeded => {
                Error::CapacityExceeded("process cap reached".to_string())
            },
            P::NotFound(id) => Error::NotFound(id),
            P::SpawnFailed(msg) => Error::SpawnFailed(msg),
            P::Io(e) => Error::Io(e),
        }
    }
}
