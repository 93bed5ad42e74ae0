//! Configuration for ddm-bridge
//!
//! Loads configuration from a TOML file. Every section and key is optional;
//! missing values fall back to the defaults below.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub discovery: DiscoveryConfig,
    pub clients: ClientsConfig,
    pub logging: LoggingConfig,
}

/// Bridge daemon connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address of the bridge daemon
    ///
    /// Examples:
    /// - `127.0.0.1:5037` - Default local daemon
    /// - `127.0.0.1:5038` - Daemon started with a custom port
    pub address: String,
    /// Connect timeout for every daemon connection
    pub connect_timeout_ms: u64,
    /// Read timeout for blocking request/response exchanges
    pub read_timeout_ms: u64,
    /// Executable used to restart the daemon
    pub adb_path: String,
}

/// Device discovery loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Delay between connection attempts
    pub retry_delay_ms: u64,
    /// Consecutive connect failures before the daemon is restarted
    pub restart_after_attempts: u32,
}

/// Client tracking and session settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientsConfig {
    /// Track processes on online devices and open sessions to them
    pub enabled: bool,
    /// Open a local debugger port for every session
    pub debugger_forwarding: bool,
    /// First port of the debugger port pool
    pub debugger_port_base: u16,
    /// Number of ports in the pool
    pub debugger_port_count: u16,
    /// Settle time between dropping and reopening a client
    pub reopen_delay_ms: u64,
    /// Time allowed for the remote side to answer the handshake
    pub handshake_timeout_ms: u64,
    /// Immediate retracking attempts after a tracking socket fails
    pub max_retrack_attempts: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5037".to_string(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 5000,
            adb_path: "adb".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            restart_after_attempts: 10,
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debugger_forwarding: true,
            debugger_port_base: 8600,
            debugger_port_count: 100,
            reopen_delay_ms: 1000,
            handshake_timeout_ms: 2000,
            max_retrack_attempts: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Parsed daemon address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.address
            .parse()
            .map_err(|e| Error::Config(format!("invalid bridge address {:?}: {}", self.address, e)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl DiscoveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ClientsConfig {
    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```no_run
    /// use ddm_bridge::config::Config;
    ///
    /// let config = Config::load("ddm-bridge.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check values that serde cannot check
    pub fn validate(&self) -> Result<()> {
        self.bridge.socket_addr()?;

        if self.clients.debugger_port_count == 0 {
            return Err(Error::Config("debugger_port_count must be > 0".to_string()));
        }
        let last = u32::from(self.clients.debugger_port_base)
            + u32::from(self.clients.debugger_port_count)
            - 1;
        if last > u32::from(u16::MAX) {
            return Err(Error::Config(format!(
                "debugger port range {}+{} exceeds 65535",
                self.clients.debugger_port_base, self.clients.debugger_port_count
            )));
        }
        Ok(())
    }
}
