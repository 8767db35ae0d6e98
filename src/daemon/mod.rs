//! Signal-driven shutdown coordination. The teacher's PID-file
//! daemonization (`DaemonManager`/`daemonize` crate) forked and detached
//! the broker process itself — out of scope here (SPEC_FULL §12); the
//! broker runs in the foreground under whatever supervises it, and only
//! needs to react to `SIGTERM`/`SIGINT` gracefully.

pub mod signals;

pub use signals::setup_signal_handlers;
