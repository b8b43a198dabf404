//! Configuration loading and validation

use anyhow::Result;
use mibridge_core::{DeviceId, Token};
use mibridge_discovery::{Credentials, StaticDevice};
use mibridge_platform::{PlatformConfig, PollConfig};
use mibridge_rpc::MIIO_PORT;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub platform: PlatformSection,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the REST API
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Persisted accessory records
    #[serde(default = "default_store")]
    pub store: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            store: default_store(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8581".to_string()
}

fn default_store() -> String {
    "./accessories.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSection {
    /// Poll devices for state changes
    #[serde(default = "default_true", alias = "pollChanges")]
    pub poll_changes: bool,
    /// Sweep period in seconds
    #[serde(default = "default_poll_interval", alias = "pollInterval")]
    pub poll_interval: u64,
    /// Discovery cache lifetime in seconds
    #[serde(default = "default_search_interval", alias = "searchInterval")]
    pub search_interval: u64,
    #[serde(default = "default_spacing_floor", alias = "pollSpacingFloorMs")]
    pub poll_spacing_floor_ms: u64,
    /// Limit for every device call
    #[serde(default = "default_query_timeout", alias = "queryTimeoutMs")]
    pub query_timeout_ms: u64,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            poll_changes: true,
            poll_interval: default_poll_interval(),
            search_interval: default_search_interval(),
            poll_spacing_floor_ms: default_spacing_floor(),
            query_timeout_ms: default_query_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    15
}

fn default_search_interval() -> u64 {
    30
}

fn default_spacing_floor() -> u64 {
    50
}

fn default_query_timeout() -> u64 {
    mibridge_rpc::DEFAULT_TIMEOUT_MS
}

impl PlatformSection {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn search_interval(&self) -> Duration {
        Duration::from_secs(self.search_interval)
    }

    pub fn to_platform_config(&self) -> PlatformConfig {
        PlatformConfig {
            poll_changes: self.poll_changes,
            poll: PollConfig {
                // A zero period would turn the scheduler into a busy loop
                period: Duration::from_secs(self.poll_interval.max(1)),
                spacing_floor: Duration::from_millis(self.poll_spacing_floor_ms),
                query_timeout: self.query_timeout(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Device RPC relay endpoint
    #[serde(default = "default_gateway")]
    pub gateway: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            gateway: default_gateway(),
        }
    }
}

fn default_gateway() -> String {
    "http://127.0.0.1:54321".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Browse for devices over mDNS
    #[serde(default = "default_true")]
    pub mdns: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { mdns: true }
    }
}

/// Known device: credentials, optionally a static address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub token: Option<String>,
    pub address: Option<IpAddr>,
    #[serde(default = "default_device_port")]
    pub port: u16,
    pub model: Option<String>,
}

fn default_device_port() -> u16 {
    MIIO_PORT
}

impl Config {
    /// Token table from the `[[device]]` entries; invalid entries are skipped
    pub fn credentials(&self) -> Credentials {
        let mut credentials = Credentials::new();
        for device in &self.devices {
            let Some(id) = DeviceId::new(device.id.as_str()) else {
                warn!("Skipping device entry with empty id");
                continue;
            };
            let Some(token) = device.token.as_deref() else {
                continue;
            };
            match Token::parse(token) {
                Ok(token) => credentials.insert(id, token),
                Err(e) => warn!(device = %id, error = %e, "Ignoring invalid token"),
            }
        }
        credentials
    }

    /// Devices announced at startup without mDNS
    pub fn static_devices(&self) -> Vec<StaticDevice> {
        self.devices
            .iter()
            .filter_map(|device| {
                Some(StaticDevice {
                    id: device.id.clone(),
                    address: device.address?,
                    port: device.port,
                    model: device.model.clone(),
                    token: device.token.clone(),
                })
            })
            .collect()
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), devices = config.devices.len(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
