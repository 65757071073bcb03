// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for wg-provision
//!
//! Every field carries a serde default, so an empty or missing file yields the
//! stock single-gateway, single-client layout.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
const MAX_INTERFACE_NAME: usize = 15;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway interface settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// The single client provisioned alongside the gateway
    #[serde(default)]
    pub client: ClientConfig,

    /// Peer-allocation daemon settings
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// System package installation
    #[serde(default)]
    pub packages: PackageConfig,

    /// Kernel forwarding persistence
    #[serde(default)]
    pub forwarding: ForwardingConfig,

    /// Service manager settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// WireGuard interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Gateway tunnel address with the tunnel network prefix
    #[serde(default = "default_gateway_address")]
    pub address: Ipv4Net,

    /// UDP listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Directory holding `<interface>.conf`
    #[serde(default = "default_wireguard_dir")]
    pub config_dir: PathBuf,

    /// Public host name or address clients dial; discovered when unset
    #[serde(default)]
    pub public_endpoint: Option<String>,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client host address (must be a /32 inside the gateway network)
    #[serde(default = "default_client_address")]
    pub address: Ipv4Net,

    /// DNS resolver pushed to the client
    #[serde(default = "default_dns")]
    pub dns: String,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,

    /// Directory for rendered client configs
    #[serde(default = "default_client_dir")]
    pub config_dir: PathBuf,
}

/// Peer-allocation daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Address the daemon binds its API listener to
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Maximum number of dynamic peers the daemon admits
    #[serde(default = "default_peer_limit")]
    pub peer_limit: u32,

    /// Daemon database path
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Where the daemon's own config is rendered
    #[serde(default = "default_allocator_config_path")]
    pub config_path: PathBuf,

    /// Installed daemon binary
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Launch arguments; `{config}` is replaced with `config_path`
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Distribution package providing the daemon, if any
    #[serde(default)]
    pub package: Option<String>,

    /// Source repository used when no package exists
    #[serde(default = "default_repository")]
    pub repository: String,

    /// Checkout directory for source builds
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,

    /// Build output path relative to `build_dir`
    #[serde(default = "default_build_artifact")]
    pub build_artifact: PathBuf,

    /// Seconds to wait for the daemon listener (0 disables the check)
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
}

/// Package installation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Package manager binary
    #[serde(default = "default_package_manager")]
    pub manager: String,

    /// Tool used to ask whether a package exists
    #[serde(default = "default_package_query")]
    pub query: String,

    /// Packages installed in one invocation
    #[serde(default = "default_packages")]
    pub names: Vec<String>,

    /// Refresh the package index before installing
    #[serde(default = "default_true")]
    pub refresh_index: bool,

    /// Timeout for package manager and build commands
    #[serde(default = "default_install_timeout")]
    pub timeout_secs: u64,
}

/// Forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Boot-time sysctl file the forwarding line is persisted to
    #[serde(default = "default_sysctl_conf")]
    pub sysctl_conf: PathBuf,
}

/// Service manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service manager binary
    #[serde(default = "default_service_manager")]
    pub manager: String,

    /// Unit name; defaults to `wg-quick@<interface>`
    #[serde(default)]
    pub unit: Option<String>,

    /// Enable the unit so the interface comes back after reboot
    #[serde(default = "default_true")]
    pub enable_on_boot: bool,

    /// Timeout for short-lived commands (key tools, sysctl, service manager)
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            address: default_gateway_address(),
            listen_port: default_listen_port(),
            config_dir: default_wireguard_dir(),
            public_endpoint: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: default_client_address(),
            dns: default_dns(),
            persistent_keepalive: default_keepalive(),
            config_dir: default_client_dir(),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            peer_limit: default_peer_limit(),
            database: default_database(),
            config_path: default_allocator_config_path(),
            binary: default_binary(),
            args: default_args(),
            package: None,
            repository: default_repository(),
            build_dir: default_build_dir(),
            build_artifact: default_build_artifact(),
            readiness_timeout_secs: default_readiness_timeout(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            manager: default_package_manager(),
            query: default_package_query(),
            names: default_packages(),
            refresh_index: true,
            timeout_secs: default_install_timeout(),
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            sysctl_conf: default_sysctl_conf(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            manager: default_service_manager(),
            unit: None,
            enable_on_boot: true,
            timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The parsed and validated configuration or an error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(GatewayError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Load the file when present, otherwise fall back to the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let interface = &self.gateway.interface;
        if interface.is_empty() || interface.len() > MAX_INTERFACE_NAME {
            return Err(invalid(format!(
                "gateway.interface must be 1-{} characters, got '{}'",
                MAX_INTERFACE_NAME, interface
            )));
        }

        if self.gateway.listen_port == 0 {
            return Err(invalid("gateway.listen_port cannot be 0"));
        }

        let client = self.client.address;
        if client.prefix_len() != 32 {
            return Err(invalid(format!(
                "client.address must be a single host (/32), got {}",
                client
            )));
        }
        if !self.gateway.address.contains(&client.addr()) {
            return Err(invalid(format!(
                "client.address {} is outside the gateway network {}",
                client.addr(),
                self.gateway.address.trunc()
            )));
        }
        if client.addr() == self.gateway.address.addr() {
            return Err(invalid("client.address cannot equal the gateway address"));
        }

        if self.allocator.peer_limit == 0 {
            return Err(invalid("allocator.peer_limit must be greater than 0"));
        }

        if self.packages.names.is_empty() {
            return Err(invalid("packages.names cannot be empty"));
        }

        if self.packages.timeout_secs == 0 || self.service.timeout_secs == 0 {
            return Err(invalid("command timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Path of the rendered gateway interface config
    pub fn gateway_config_path(&self) -> PathBuf {
        self.gateway
            .config_dir
            .join(format!("{}.conf", self.gateway.interface))
    }

    /// Service manager unit that brings the interface up
    pub fn service_unit(&self) -> String {
        self.service
            .unit
            .clone()
            .unwrap_or_else(|| format!("wg-quick@{}", self.gateway.interface))
    }
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::InvalidConfig {
        message: message.into(),
    }
}

// Default value functions

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_gateway_address() -> Ipv4Net {
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 1), 24)
}

fn default_listen_port() -> u16 {
    51820
}

fn default_wireguard_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard")
}

fn default_client_address() -> Ipv4Net {
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 2), 32)
}

fn default_dns() -> String {
    "1.1.1.1".to_string()
}

fn default_keepalive() -> u16 {
    25
}

fn default_client_dir() -> PathBuf {
    PathBuf::from("/etc/wireguard/clients")
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_peer_limit() -> u32 {
    100
}

fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/dynamic-wireguard/peers.db")
}

fn default_allocator_config_path() -> PathBuf {
    PathBuf::from("/etc/dynamic-wireguard/config.toml")
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/dynamic-wireguard")
}

fn default_args() -> Vec<String> {
    vec!["--config".to_string(), "{config}".to_string()]
}

fn default_repository() -> String {
    "https://github.com/xcodian/dynamic-wireguard".to_string()
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("/usr/local/src/dynamic-wireguard")
}

fn default_build_artifact() -> PathBuf {
    PathBuf::from("target/release/dynamic-wireguard")
}

fn default_readiness_timeout() -> u64 {
    10
}

fn default_package_manager() -> String {
    "apt-get".to_string()
}

fn default_package_query() -> String {
    "apt-cache".to_string()
}

fn default_packages() -> Vec<String> {
    ["wireguard", "wireguard-tools", "iproute2", "git", "cargo"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_install_timeout() -> u64 {
    1800 // source builds are slow
}

fn default_sysctl_conf() -> PathBuf {
    PathBuf::from("/etc/sysctl.conf")
}

fn default_service_manager() -> String {
    "systemctl".to_string()
}

fn default_command_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}
