//! mcp-broker — an on-host broker that multiplexes a pool of MCP servers
//! behind a single JSON-RPC 2.0 facade.
//!
//! The CLI is a thin `clap` front end wired directly to the Gateway's
//! public API (SPEC_FULL §10.4); there is no HTTP surface here, the
//! broker's front door is this process's stdin/control plane.

use clap::{Parser, Subcommand};
use mcp_broker::config::Config;
use mcp_broker::daemon::signals::setup_signal_handlers;
use mcp_broker::gateway::Gateway;
use mcp_broker::types::Frame;
use mcp_broker::Result;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "mcp-broker")]
#[command(about = "Broker that multiplexes MCP servers behind one JSON-RPC facade", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file; falls back to discovery if omitted.
    #[arg(short, long, env = "MCP_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MCP_BROKER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a configured server and keep the broker running until a
    /// shutdown signal arrives.
    Start {
        /// Server id to start, as registered in the config file.
        server_id: String,
    },

    /// Stop a running server.
    Stop {
        /// Server id to stop.
        server_id: String,
    },

    /// Send a single JSON-RPC frame to a server and print its response.
    Send {
        /// Server id to send the frame to.
        server_id: String,
        /// The JSON-RPC frame, as a JSON string.
        frame: String,
    },

    /// List configured servers.
    List,

    /// Print current Gateway metrics.
    Metrics,

    /// Validate a configuration file.
    Validate {
        /// Configuration file to validate.
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Commands::Validate { config } = &cli.command {
        return match Config::validate_file(config) {
            Ok(()) => {
                println!("{}: valid", config.display());
                Ok(())
            },
            Err(e) => {
                eprintln!("{}: invalid: {e}", config.display());
                std::process::exit(1);
            },
        };
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::discover_and_load()?,
    };
    config.validate()?;
    mcp_broker::metrics::init();

    let (gateway, mut cleanup_rx) = Gateway::new(&config);

    match cli.command {
        Commands::Start { server_id } => {
            gateway.start_server(&server_id).await?;
            info!(server_id, "server started, waiting for shutdown signal");

            let (_tx, mut shutdown_rx) = setup_signal_handlers();
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                },
                Some(event) = cleanup_rx.recv() => {
                    info!(server_id = %event.server_id, reason = ?event.reason, "server cleaned up due to inactivity");
                },
            }
            gateway.shutdown(config.graceful_terminate_window).await;
        },
        Commands::Stop { server_id } => {
            gateway.stop_server(&server_id).await?;
            println!("{server_id}: stopped");
        },
        Commands::Send { server_id, frame } => {
            let frame: Frame = serde_json::from_str(&frame)
                .map_err(|e| mcp_broker::Error::BadFrame(e.to_string()))?;
            let response = gateway.send_request(&server_id, "cli", frame).await?;
            println!("{}", serde_json::to_string_pretty(&response).unwrap());
        },
        Commands::List => {
            for server_id in gateway.list_servers() {
                println!("{server_id}");
            }
        },
        Commands::Metrics => {
            let metrics = gateway.get_metrics();
            println!("requests_total: {}", metrics.requests_total);
            println!("active_connections: {}", metrics.active_connections);
            for (transport, count) in metrics.connections_by_transport {
                println!("  {transport}: {count}");
            }
            println!("tracked_servers: {}", metrics.tracked_servers);
            println!("tracked_clients: {}", metrics.tracked_clients);
        },
        Commands::Validate { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}

