//! Configuration for tether clients.
//!
//! Settings persist to disk as `config.ron`. Every section is
//! `#[serde(default)]`, so older or partial files keep loading; command-line
//! flags parsed with clap override whatever the file says.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, Command};
pub use config::{ClientConfig, Config, DebugConfig, NetworkConfig};
pub use error::ConfigError;
