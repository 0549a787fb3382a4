//! Daemon Configuration
//!
//! Configuration management for the peerlink daemon, stored as
//! `daemon.toml` in the user's config directory.

use anyhow::{Context, Result};
use peerlink_protocol::discovery::DiscoveryConfig;
use peerlink_protocol::{DeviceType, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Pairing configuration
    #[serde(default)]
    pub pairing: PairingConfig,

    /// Plugin configuration
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Storage paths
    pub paths: PathConfig,
}

/// Device configuration
///
/// The device id is not configurable: it is the CN of the certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name announced to peers
    pub name: String,

    /// Device type (desktop, laptop, phone, tablet)
    #[serde(default = "default_device_type")]
    pub device_type: DeviceType,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP discovery port
    #[serde(default = "default_port")]
    pub discovery_port: u16,

    /// TCP channel port
    #[serde(default = "default_port")]
    pub tcp_port: u16,

    /// Destination address of identity broadcasts
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: IpAddr,

    /// Seconds between identity broadcasts; 0 disables them
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: u64,
}

/// Pairing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Seconds before an unanswered pairing request expires
    #[serde(default = "default_pairing_timeout")]
    pub timeout_secs: u64,

    /// Seconds allowed for a TLS handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Accept every incoming pairing request without asking
    #[serde(default)]
    pub auto_accept: bool,
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Enable ping plugin
    #[serde(default = "default_true")]
    pub enable_ping: bool,

    /// Enable notification plugin
    #[serde(default = "default_true")]
    pub enable_notification: bool,
}

/// Storage paths configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Configuration directory
    pub config_dir: PathBuf,

    /// PEM certificate whose CN is this device's id
    pub certificate: PathBuf,

    /// PEM private key matching the certificate
    pub private_key: PathBuf,

    /// Pinned fingerprints and known devices
    pub trust_store: PathBuf,
}

fn default_device_type() -> DeviceType {
    DeviceType::Desktop
}

fn default_port() -> u16 {
    1716
}

fn default_broadcast_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_discovery_interval() -> u64 {
    60
}

fn default_pairing_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_port(),
            tcp_port: default_port(),
            broadcast_address: default_broadcast_address(),
            discovery_interval: default_discovery_interval(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pairing_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            auto_accept: false,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable_ping: true,
            enable_notification: true,
        }
    }
}

impl PathConfig {
    fn in_dir(config_dir: PathBuf) -> Self {
        Self {
            certificate: config_dir.join("certificate.pem"),
            private_key: config_dir.join("private.pem"),
            trust_store: config_dir.join("trust.json"),
            config_dir,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: default_device_type(),
            },
            network: NetworkConfig::default(),
            pairing: PairingConfig::default(),
            plugins: PluginConfig::default(),
            paths: PathConfig::in_dir(default_config_dir()),
        }
    }
}

/// `$XDG_CONFIG_HOME/peerlink` or its platform equivalent
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("peerlink")
}

impl Config {
    /// Load the configuration from the default location, creating it if
    /// missing
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_dir().join(CONFIG_FILE))
    }

    /// Load configuration from `path`, writing defaults there if not found
    ///
    /// Default paths are placed next to the file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(default_config_dir);
            let config = Config {
                paths: PathConfig::in_dir(dir),
                ..Config::default()
            };
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)
            .context("Failed to create config directory")?;
        if let Some(parent) = self.paths.trust_store.parent() {
            fs::create_dir_all(parent).context("Failed to create trust store directory")?;
        }
        Ok(())
    }

    /// Registry settings derived from this configuration
    pub fn registry_config(&self) -> RegistryConfig {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        RegistryConfig {
            device_name: self.device.name.clone(),
            device_type: self.device.device_type,
            discovery: DiscoveryConfig {
                bind_addr: SocketAddr::new(any, self.network.discovery_port),
                broadcast_addr: SocketAddr::new(
                    self.network.broadcast_address,
                    self.network.discovery_port,
                ),
                ..DiscoveryConfig::default()
            },
            tcp_bind_addr: SocketAddr::new(any, self.network.tcp_port),
            pairing_timeout: Duration::from_secs(self.pairing.timeout_secs),
            handshake_timeout: Duration::from_secs(self.pairing.handshake_timeout_secs),
            ..RegistryConfig::default()
        }
    }

    /// Interval between periodic announcements, if enabled
    pub fn discovery_interval(&self) -> Option<Duration> {
        match self.network.discovery_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
