//! Device list filtering, sorting and summary

use clap::ValueEnum;
use labscan_core::{DeviceIdentity, DeviceType, PowerState, SshStatus};
use labscan_discovery::{DeviceSummary, DiscoveryMode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How fresh the listed data must be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    /// Cache snapshot, no probing
    Cached,
    /// Re-probe stale cached devices under the quick budget
    #[default]
    Quick,
    /// Configured, cached and swept devices under the full budget
    Full,
}

impl ListMode {
    pub fn discovery_mode(self) -> Option<DiscoveryMode> {
        match self {
            ListMode::Cached => None,
            ListMode::Quick => Some(DiscoveryMode::Quick),
            ListMode::Full => Some(DiscoveryMode::Full),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    #[default]
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Ip,
    Name,
    Status,
    #[value(alias = "last_seen")]
    LastSeen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Presentation options for a device listing
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub mode: ListMode,
    /// Probe every selected device regardless of staleness
    pub force: bool,
    pub device_type: Option<DeviceType>,
    pub ssh_status: Option<SshStatus>,
    pub status: Option<OnlineStatus>,
    pub power_state: Option<PowerState>,
    /// Case-insensitive substring of key, ip, hostname or friendly name
    pub search: Option<String>,
    pub sort_by: SortKey,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

/// Filtered device list with the summary of what is shown
#[derive(Debug, Clone, Serialize)]
pub struct DeviceListing {
    pub devices: Vec<DeviceIdentity>,
    pub summary: DeviceSummary,
}

impl ListQuery {
    pub fn matches(&self, record: &DeviceIdentity) -> bool {
        if let Some(device_type) = self.device_type {
            if record.device_type() != device_type {
                return false;
            }
        }
        if let Some(ssh_status) = self.ssh_status {
            if record.ssh_status != ssh_status {
                return false;
            }
        }
        if let Some(status) = self.status {
            let online = record.is_online();
            if online != (status == OnlineStatus::Online) {
                return false;
            }
        }
        if let Some(power_state) = self.power_state {
            if record.power_state() != Some(power_state) {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().map(str::trim) {
            if !search.is_empty() && !matches_search(record, &search.to_lowercase()) {
                return false;
            }
        }
        true
    }

    /// Filter, sort and truncate; the summary counts the filtered set
    pub fn apply(&self, records: Vec<DeviceIdentity>) -> DeviceListing {
        let mut devices: Vec<_> = records.into_iter().filter(|r| self.matches(r)).collect();

        devices.sort_by(|a, b| {
            let ordering = compare(a, b, self.sort_by);
            match self.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let summary = DeviceSummary::of(&devices);
        if let Some(limit) = self.limit {
            devices.truncate(limit);
        }

        DeviceListing { devices, summary }
    }
}

fn matches_search(record: &DeviceIdentity, needle: &str) -> bool {
    let ip = record.ip.map(|ip| ip.to_string());
    let matched = [
        Some(record.device_key.as_str()),
        ip.as_deref(),
        record.hostname.as_deref(),
        record.friendly_name.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| field.to_lowercase().contains(needle));
    matched
}

fn compare(a: &DeviceIdentity, b: &DeviceIdentity, key: SortKey) -> Ordering {
    let primary = match key {
        // Records without an address go last
        SortKey::Ip => match (a.ip, b.ip) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
        SortKey::Name => a
            .display_name()
            .to_lowercase()
            .cmp(&b.display_name().to_lowercase()),
        // Online first, then by remote shell result
        SortKey::Status => b
            .is_online()
            .cmp(&a.is_online())
            .then(a.ssh_status.cmp(&b.ssh_status)),
        SortKey::LastSeen => a.last_seen.cmp(&b.last_seen),
    };
    primary.then_with(|| a.device_key.cmp(&b.device_key))
}
