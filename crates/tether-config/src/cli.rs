//! Command-line argument parsing for the tether client.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::Config;

/// Tether command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tether TCP session client")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Number of parallel connections.
    #[arg(long)]
    pub connections: Option<usize>,

    /// Milliseconds between test echoes.
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// What to run. Defaults to the echo client.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Run modes.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect to the server and send test echoes.
    Client,
    /// Accept connections and answer each test echo with the server-side
    /// session id and the same number. Other protocols are dropped.
    EchoServer {
        /// Bind address (defaults to `0.0.0.0:<port>`).
        #[arg(long)]
        bind: Option<String>,
    },
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(n) = args.connections {
            self.network.parallel_connects = n;
        }
        if let Some(ms) = args.interval_ms {
            self.client.echo_interval_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
