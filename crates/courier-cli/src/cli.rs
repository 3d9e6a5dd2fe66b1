//! Clap CLI definitions for Courier.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  courier host --listen 127.0.0.1:3000                 Run a host node
  courier host --listen 127.0.0.1:3001 --join tcp://127.0.0.1:3000
  courier ping tcp://127.0.0.1:3000                    Check a host is alive
  courier send --via tcp://127.0.0.1:3000 --to a2 '\"hi\"'
  courier config                                       Print the effective config";

/// Courier: actor messaging over a self-organizing host mesh.
#[derive(Parser)]
#[command(name = "courier", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (defaults to ~/.courier/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a host node until Ctrl+C, printing host events as JSON lines.
    Host {
        /// Socket address to listen on (overrides `listen` in the config).
        #[arg(long)]
        listen: Option<String>,
        /// Host URL to join; may be repeated (added to `join` in the config).
        #[arg(long)]
        join: Vec<String>,
        /// Network id (overrides `host.networkId` in the config).
        #[arg(long)]
        network_id: Option<String>,
    },
    /// Ping a host and print the echoed payload.
    Ping {
        /// Host URL, e.g. tcp://127.0.0.1:3000.
        url: String,
        /// JSON payload to echo.
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Send a JSON message to a peer reachable through a host.
    Send {
        /// Host URL to join first.
        #[arg(long)]
        via: String,
        /// Destination peer id.
        #[arg(long)]
        to: String,
        /// Sender id to use.
        #[arg(long, default_value = "courier-cli")]
        from: String,
        /// Wait for a reply using the request/reply envelope.
        #[arg(long)]
        request: bool,
        /// Reply timeout in milliseconds (with --request).
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        /// JSON message body.
        message: String,
    },
    /// Print the effective configuration as TOML.
    Config,
}
