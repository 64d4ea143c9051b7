//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Connection and pipeline settings.
    pub network: NetworkConfig,
    /// Echo client behaviour.
    pub client: ClientConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Connection and session pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server host name or IP address.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Connections opened in parallel at startup.
    pub parallel_connects: usize,
    /// Connect timeout in seconds (0 = wait for the OS).
    pub connect_timeout_seconds: u64,
    /// Packets gathered into one socket write.
    pub send_batch_limit: usize,
    /// Bytes per pooled buffer.
    pub buffer_capacity: usize,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive.
    pub keepalive: bool,
}

/// Echo client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Milliseconds between test echoes on each session.
    pub echo_interval_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 7777,
            parallel_connects: 1,
            connect_timeout_seconds: 0,
            send_batch_limit: 500,
            buffer_capacity: u16::MAX as usize * 3,
            tcp_nodelay: true,
            keepalive: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            echo_interval_ms: 1000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Derived values ---

impl NetworkConfig {
    /// `host:port` of the server.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    /// Connect timeout, `None` when disabled.
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_seconds > 0).then(|| Duration::from_secs(self.connect_timeout_seconds))
    }
}

impl ClientConfig {
    /// Interval between test echoes.
    pub fn echo_interval(&self) -> Duration {
        Duration::from_millis(self.echo_interval_ms)
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = std::fs::read_to_string(config_dir.join(CONFIG_FILE))
            .map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the networking core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let network = &self.network;
        if network.parallel_connects == 0 {
            return Err(ConfigError::Invalid {
                field: "network.parallel_connects",
                reason: "must open at least one connection",
            });
        }
        if network.send_batch_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "network.send_batch_limit",
                reason: "must be at least 1",
            });
        }
        // Four bytes of header plus at least one payload byte.
        if network.buffer_capacity <= 4 {
            return Err(ConfigError::Invalid {
                field: "network.buffer_capacity",
                reason: "must exceed the 4-byte frame header",
            });
        }
        if self.client.echo_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "client.echo_interval_ms",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}
