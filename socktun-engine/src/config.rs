//! Configuration types for the session engine

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::DEFAULT_SOCKET_PATH;
use crate::engine::EngineKind;
use crate::error::{Error, Result};

/// Default location of the profile store
pub const DEFAULT_STORE_PATH: &str = "/var/lib/socktun/profiles.json";

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// log_level = "info"
/// auto_connect = true
///
/// [tunnel]
/// mtu = 1500
/// address = "10.0.0.2"
/// bypass_dns = "1.1.1.1"
/// stop_timeout_ms = 2000
///
/// [control]
/// socket = "/var/run/socktun.sock"
///
/// [store]
/// path = "/var/lib/socktun/profiles.json"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Reconnect the selected profile when the daemon starts
    #[serde(default)]
    pub auto_connect: bool,

    /// Tunnel interface and session settings
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Forwarding engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Control socket settings
    #[serde(default)]
    pub control: ControlConfig,

    /// Profile store settings
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            auto_connect: false,
            tunnel: TunnelConfig::default(),
            engine: EngineConfig::default(),
            control: ControlConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(Error::Config(format!("unknown log level '{}'", other)));
            }
        }

        self.tunnel.validate()?;

        if self.engine.kind == EngineKind::Command && self.engine.program.as_os_str().is_empty() {
            return Err(Error::Config("engine program is required".into()));
        }

        if self.control.socket.as_os_str().is_empty() {
            return Err(Error::Config("control socket path is required".into()));
        }

        if self.store.path.as_os_str().is_empty() {
            return Err(Error::Config("store path is required".into()));
        }

        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# socktun configuration

# Log level: "error", "warn", "info", "debug", "trace"
# RUST_LOG overrides this when set.
log_level = "info"

# Reconnect the selected profile at daemon start if it was connected
# when the daemon last stopped (default: false)
auto_connect = false

[tunnel]
# MTU for the tunnel interface (default: 1500)
mtu = 1500

# Local tunnel address, installed as a /32 (default: 10.0.0.2)
address = "10.0.0.2"

# Address kept off the tunnel so DNS queries to it do not loop (default: 1.1.1.1)
bypass_dns = "1.1.1.1"

# Keep the daemon's own traffic off the tunnel where the platform allows it
exclude_self = true

# How long a disconnect waits for the engine before releasing the
# interface anyway, in milliseconds (default: 2000)
stop_timeout_ms = 2000

# Label for the session
session_name = "socktun"

# TUN device name (optional, auto-assigned if not set)
# name = "socktun0"

[engine]
# "command" runs an external tun2socks executable with the interface
# descriptor as fd://N; "native" calls the linked libtun2socks
# (requires a build with the native-engine feature)
kind = "command"
program = "tun2socks"
# Extra arguments appended to the command line
# args = ["-loglevel", "warning"]

[control]
# Unix socket used by `socktun connect/disconnect/status`
socket = "/var/run/socktun.sock"

[store]
# Saved proxy profiles and the selected entry
path = "/var/lib/socktun/profiles.json"
"#
        .to_string()
    }
}

/// Tunnel interface and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// MTU for the tunnel interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Local tunnel address
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,

    /// Bypass address excluded from the tunnel
    #[serde(default = "default_bypass_dns")]
    pub bypass_dns: Ipv4Addr,

    /// Keep this process's traffic off the tunnel
    #[serde(default = "default_true")]
    pub exclude_self: bool,

    /// Bounded wait for the engine worker on disconnect
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Session label
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// TUN device name
    #[serde(default)]
    pub name: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            address: default_address(),
            bypass_dns: default_bypass_dns(),
            exclude_self: true,
            stop_timeout_ms: default_stop_timeout_ms(),
            session_name: default_session_name(),
            name: None,
        }
    }
}

impl TunnelConfig {
    /// Validate tunnel settings
    pub fn validate(&self) -> Result<()> {
        if self.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.mtu
            )));
        }

        if self.stop_timeout_ms == 0 {
            return Err(Error::Config("stop_timeout_ms must be positive".into()));
        }

        if self.address == self.bypass_dns {
            return Err(Error::Config(format!(
                "tunnel address {} cannot also be the bypass address",
                self.address
            )));
        }

        Ok(())
    }

    /// Disconnect timeout as a duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Forwarding engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,

    /// Executable for the command engine
    #[serde(default = "default_engine_program")]
    pub program: PathBuf,

    /// Extra command-line arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            program: default_engine_program(),
            args: Vec::new(),
        }
    }
}

/// Control socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: default_socket_path(),
        }
    }
}

/// Profile store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mtu() -> u16 {
    socktun_tun::DEFAULT_MTU
}

fn default_address() -> Ipv4Addr {
    socktun_tun::DEFAULT_ADDRESS
}

fn default_bypass_dns() -> Ipv4Addr {
    socktun_tun::DEFAULT_BYPASS_DNS
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

fn default_session_name() -> String {
    "socktun".to_string()
}

fn default_engine_program() -> PathBuf {
    PathBuf::from("tun2socks")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

fn default_true() -> bool {
    true
}
