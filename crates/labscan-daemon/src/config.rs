//! Configuration loading and validation

use anyhow::{bail, Context, Result};
use labscan_core::credentials::default_key_files;
use labscan_core::{ConfiguredDevice, DefaultCredentials, DeviceKey};
use labscan_discovery::{SchedulerConfig, TargetRange};
use labscan_probe::{HTTP_PORT, INSTRUMENT_PORTS, SSH_PORT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Network swept in full mode (CIDR). Empty disables the sweep.
    #[serde(default = "default_target_network")]
    pub target_network: String,
    /// Seconds after which a cached entry is re-probed
    #[serde(default = "default_staleness")]
    pub staleness_secs: i64,
    /// Devices probed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_cycle_budget")]
    pub cycle_budget_secs: u64,
    #[serde(default = "default_quick_budget")]
    pub quick_budget_secs: u64,
    #[serde(default = "default_max_sweep_hosts")]
    pub max_sweep_hosts: usize,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// SCPI raw socket ports, tried in order
    #[serde(default = "default_instrument_ports")]
    pub instrument_ports: Vec<u16>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target_network: default_target_network(),
            staleness_secs: default_staleness(),
            concurrency: default_concurrency(),
            probe_timeout_ms: default_probe_timeout(),
            cycle_budget_secs: default_cycle_budget(),
            quick_budget_secs: default_quick_budget(),
            max_sweep_hosts: default_max_sweep_hosts(),
            ssh_port: default_ssh_port(),
            http_port: default_http_port(),
            instrument_ports: default_instrument_ports(),
        }
    }
}

fn default_target_network() -> String {
    "192.168.2.0/24".to_string()
}

fn default_staleness() -> i64 {
    300
}

fn default_concurrency() -> usize {
    4
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_cycle_budget() -> u64 {
    120
}

fn default_quick_budget() -> u64 {
    5
}

fn default_max_sweep_hosts() -> usize {
    254
}

fn default_ssh_port() -> u16 {
    SSH_PORT
}

fn default_http_port() -> u16 {
    HTTP_PORT
}

fn default_instrument_ports() -> Vec<u16> {
    INSTRUMENT_PORTS.to_vec()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding identities.json and credentials.json
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|dir| dir.join("labscan"))
                .unwrap_or_else(|| PathBuf::from(".labscan"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_username")]
    pub default_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_password: Option<String>,
    /// Private keys for public-key auth; `~/.ssh/id_ed25519` and
    /// `~/.ssh/id_rsa` when empty
    #[serde(default)]
    pub key_files: Vec<PathBuf>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            default_username: default_username(),
            default_password: None,
            key_files: Vec::new(),
        }
    }
}

fn default_username() -> String {
    "root".to_string()
}

impl CredentialsConfig {
    pub fn to_defaults(&self) -> DefaultCredentials {
        DefaultCredentials {
            username: self.default_username.clone(),
            password: self.default_password.clone(),
            key_files: if self.key_files.is_empty() {
                default_key_files()
            } else {
                self.key_files.clone()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Statically configured device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub key: String,
    /// Fixed address; without one the last cached address is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Remote shell username for this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Key of the switch powering this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_switch: Option<String>,
}

impl Config {
    /// Override the sweep target (command line or environment)
    pub fn with_target_network(mut self, target: Option<String>) -> Self {
        if let Some(target) = target {
            self.discovery.target_network = target;
        }
        self
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.storage.resolved_dir()
    }

    pub fn target(&self) -> Result<Option<TargetRange>> {
        let target = self.discovery.target_network.trim();
        if target.is_empty() {
            return Ok(None);
        }
        let range = target
            .parse::<TargetRange>()
            .with_context(|| format!("Invalid target_network '{}'", target))?;
        Ok(Some(range))
    }

    /// Scheduler settings derived from this configuration
    pub fn to_scheduler_config(&self) -> Result<SchedulerConfig> {
        let discovery = &self.discovery;
        Ok(SchedulerConfig {
            staleness_secs: discovery.staleness_secs,
            concurrency: discovery.concurrency.max(1),
            probe_timeout: Duration::from_millis(discovery.probe_timeout_ms),
            cycle_budget: Duration::from_secs(discovery.cycle_budget_secs),
            quick_budget: Duration::from_secs(discovery.quick_budget_secs),
            target: self.target()?,
            max_sweep_hosts: discovery.max_sweep_hosts,
            devices: self
                .devices
                .iter()
                .map(|device| ConfiguredDevice {
                    device_key: DeviceKey::new(&device.key),
                    ip: device.ip,
                    username: device.username.clone(),
                })
                .collect(),
        })
    }

    /// Configured `power_switch` links, device → switch
    pub fn explicit_links(&self) -> BTreeMap<DeviceKey, DeviceKey> {
        self.devices
            .iter()
            .filter_map(|device| {
                device
                    .power_switch
                    .as_deref()
                    .map(str::trim)
                    .filter(|switch| !switch.is_empty())
                    .map(|switch| (DeviceKey::new(&device.key), DeviceKey::new(switch)))
            })
            .collect()
    }

    pub fn device(&self, key: &DeviceKey) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.key == key.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        self.target()?;

        let mut seen = HashSet::new();
        for (index, device) in self.devices.iter().enumerate() {
            if device.key.trim().is_empty() {
                bail!("Device entry {} has an empty key", index + 1);
            }
            if !seen.insert(device.key.as_str()) {
                bail!("Device key '{}' is configured twice", device.key);
            }
        }
        if self.discovery.instrument_ports.is_empty() {
            bail!("instrument_ports must list at least one port");
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!(path = %path.display(), devices = config.devices.len(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };
    Ok(config)
}
