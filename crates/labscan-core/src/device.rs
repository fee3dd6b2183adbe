//! Device identity types for tracking lab hardware

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Stable logical identifier for a device, independent of its address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(pub String);

impl DeviceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key derived from a learned hardware id (serial number, machine-id, MAC)
    pub fn from_unique_id(unique_id: &str) -> Self {
        let normalized: String = unique_id
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self(format!("hw-{}", normalized))
    }

    /// Provisional key for a swept host whose hardware id is not known yet
    pub fn provisional(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self(format!("ip-{}-{}-{}-{}", a, b, c, d))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with("ip-")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of the most recent remote shell attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshStatus {
    Ok,
    Timeout,
    Refused,
    AuthFailed,
    Unknown,
}

impl Default for SshStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl SshStatus {
    /// Ranking used when several failures were observed for one device.
    /// `auth_failed` and `refused` prove the host is reachable, so they
    /// outrank a bare timeout.
    pub fn informativeness(self) -> u8 {
        match self {
            SshStatus::Ok => 4,
            SshStatus::AuthFailed => 3,
            SshStatus::Refused => 2,
            SshStatus::Timeout => 1,
            SshStatus::Unknown => 0,
        }
    }

    /// Pick the more informative of two statuses
    pub fn most_informative(self, other: SshStatus) -> SshStatus {
        if other.informativeness() > self.informativeness() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SshStatus::Ok => "ok",
            SshStatus::Timeout => "timeout",
            SshStatus::Refused => "refused",
            SshStatus::AuthFailed => "auth_failed",
            SshStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SshStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ok" => Ok(SshStatus::Ok),
            "timeout" => Ok(SshStatus::Timeout),
            "refused" => Ok(SshStatus::Refused),
            "auth_failed" | "auth-failed" => Ok(SshStatus::AuthFailed),
            "unknown" => Ok(SshStatus::Unknown),
            other => Err(format!("unknown ssh status '{}'", other)),
        }
    }
}

/// Relay state reported by a smart power switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    /// Parse the relay state strings used by switch firmware ("ON", "off", "1")
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(PowerState::On),
            "off" | "0" | "false" => Some(PowerState::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }
}

/// Device classification with the fields only valid for each type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device_type", rename_all = "snake_case")]
pub enum DeviceKind {
    /// Host answering the remote shell (embedded Linux board, server)
    Generic,
    /// Smart power switch answering the web API
    PowerSwitch {
        #[serde(default)]
        power_state: Option<PowerState>,
        #[serde(default)]
        power_watts: Option<f64>,
        /// Name of the load the switch was configured for
        #[serde(default)]
        load_name: Option<String>,
    },
    /// Programmable instrument answering `*IDN?`
    TestInstrument {
        #[serde(default)]
        manufacturer: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        port: Option<u16>,
    },
    Unknown,
}

impl Default for DeviceKind {
    fn default() -> Self {
        Self::Unknown
    }
}

impl DeviceKind {
    pub fn device_type(&self) -> DeviceType {
        match self {
            DeviceKind::Generic => DeviceType::Generic,
            DeviceKind::PowerSwitch { .. } => DeviceType::PowerSwitch,
            DeviceKind::TestInstrument { .. } => DeviceType::TestInstrument,
            DeviceKind::Unknown => DeviceType::Unknown,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, DeviceKind::Unknown)
    }

    /// Merge a newer classification over this one.
    ///
    /// `Unknown` never replaces a known kind. When the type is unchanged,
    /// payload fields are only overwritten by present values.
    pub fn merge_from(&mut self, newer: &DeviceKind) {
        match (&mut *self, newer) {
            (_, DeviceKind::Unknown) => {}
            (
                DeviceKind::PowerSwitch {
                    power_state,
                    power_watts,
                    load_name,
                },
                DeviceKind::PowerSwitch {
                    power_state: new_state,
                    power_watts: new_watts,
                    load_name: new_load,
                },
            ) => {
                if new_state.is_some() {
                    *power_state = *new_state;
                }
                if new_watts.is_some() {
                    *power_watts = *new_watts;
                }
                if let Some(name) = non_empty(new_load.as_deref()) {
                    *load_name = Some(name.to_string());
                }
            }
            (
                DeviceKind::TestInstrument {
                    manufacturer,
                    model,
                    port,
                },
                DeviceKind::TestInstrument {
                    manufacturer: new_manufacturer,
                    model: new_model,
                    port: new_port,
                },
            ) => {
                if let Some(m) = non_empty(new_manufacturer.as_deref()) {
                    *manufacturer = Some(m.to_string());
                }
                if let Some(m) = non_empty(new_model.as_deref()) {
                    *model = Some(m.to_string());
                }
                if new_port.is_some() {
                    *port = *new_port;
                }
            }
            (current, newer) => *current = newer.clone(),
        }
    }
}

/// Flat device type, used for filtering and summary counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Generic,
    PowerSwitch,
    TestInstrument,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Generic => "generic",
            DeviceType::PowerSwitch => "power_switch",
            DeviceType::TestInstrument => "test_instrument",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "generic" => Ok(DeviceType::Generic),
            "power_switch" | "switch" => Ok(DeviceType::PowerSwitch),
            "test_instrument" | "instrument" => Ok(DeviceType::TestInstrument),
            "unknown" => Ok(DeviceType::Unknown),
            other => Err(format!("unknown device type '{}'", other)),
        }
    }
}

/// One cached identity record per logical device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_key: DeviceKey,
    /// Last known address (may change with DHCP)
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(flatten)]
    pub kind: DeviceKind,
    #[serde(default)]
    pub ssh_status: SshStatus,
    /// Last successful identification
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Last probe attempt, successful or not
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    /// User-assigned label, only changed by an explicit rename
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Power switch believed to control this device
    #[serde(default)]
    pub controlled_by: Option<DeviceKey>,
}

impl DeviceIdentity {
    /// Create an empty record for a key that has never been probed
    pub fn new(device_key: DeviceKey) -> Self {
        Self {
            device_key,
            ip: None,
            hostname: None,
            unique_id: None,
            firmware_version: None,
            kind: DeviceKind::Unknown,
            ssh_status: SshStatus::Unknown,
            last_seen: None,
            last_attempt: None,
            friendly_name: None,
            controlled_by: None,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.kind.device_type()
    }

    /// Label for listings: friendly name, then hostname, then key
    pub fn display_name(&self) -> &str {
        self.friendly_name
            .as_deref()
            .or(self.hostname.as_deref())
            .unwrap_or(self.device_key.as_str())
    }

    /// Whether the last attempt re-identified the device
    pub fn is_online(&self) -> bool {
        match (self.last_seen, self.last_attempt) {
            (Some(seen), Some(attempt)) => seen >= attempt,
            _ => false,
        }
    }

    /// Check if the last attempt is older than the threshold (or missing)
    pub fn is_stale(&self, now: DateTime<Utc>, threshold_secs: i64) -> bool {
        match self.last_attempt {
            Some(attempt) => (now - attempt).num_seconds() > threshold_secs,
            None => true,
        }
    }

    pub fn power_state(&self) -> Option<PowerState> {
        match &self.kind {
            DeviceKind::PowerSwitch { power_state, .. } => *power_state,
            _ => None,
        }
    }

    pub fn power_watts(&self) -> Option<f64> {
        match &self.kind {
            DeviceKind::PowerSwitch { power_watts, .. } => *power_watts,
            _ => None,
        }
    }

    /// Stored hardware id when a patch identified a different device.
    ///
    /// Ids are compared the way keys are derived from them, so formatting
    /// differences (case, separators) are not a mismatch.
    pub fn unique_id_mismatch<'a>(&'a self, patch: &IdentityPatch) -> Option<&'a str> {
        let stored = non_empty(self.unique_id.as_deref())?;
        let found = non_empty(patch.unique_id.as_deref())?;
        if DeviceKey::from_unique_id(stored) == DeviceKey::from_unique_id(found) {
            None
        } else {
            Some(stored)
        }
    }
}

/// Probe outcome for one device, ready to be merged into the cache
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityPatch {
    /// When the probe set was started; becomes `last_attempt`
    pub attempted_at: DateTime<Utc>,
    /// Address that was probed
    pub ip: Option<IpAddr>,
    /// True when at least one probe identified the device
    pub identified: bool,
    pub hostname: Option<String>,
    pub unique_id: Option<String>,
    pub firmware_version: Option<String>,
    pub kind: DeviceKind,
    pub ssh_status: SshStatus,
}

impl IdentityPatch {
    /// Patch for an attempt where nothing answered
    pub fn failed(ip: Option<IpAddr>, ssh_status: SshStatus, attempted_at: DateTime<Utc>) -> Self {
        Self {
            attempted_at,
            ip,
            identified: false,
            hostname: None,
            unique_id: None,
            firmware_version: None,
            kind: DeviceKind::Unknown,
            ssh_status,
        }
    }
}

/// A device the scheduler may probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub device_key: DeviceKey,
    pub ip: IpAddr,
    /// Configured remote shell username, if any
    pub username: Option<String>,
    pub origin: CandidateOrigin,
}

/// A device named in the configuration. Without an address it is probed
/// at its last cached one, or skipped until it has been seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredDevice {
    pub device_key: DeviceKey,
    pub ip: Option<IpAddr>,
    pub username: Option<String>,
}

impl ConfiguredDevice {
    /// Candidate at the configured address, else at `fallback`
    pub fn candidate(&self, fallback: Option<IpAddr>) -> Option<DeviceCandidate> {
        self.ip.or(fallback).map(|ip| DeviceCandidate {
            device_key: self.device_key.clone(),
            ip,
            username: self.username.clone(),
            origin: CandidateOrigin::Configured,
        })
    }
}

/// Where a candidate came from; decides how its key may be rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Configured,
    Cached,
    Swept,
}

/// Returns the trimmed value if it carries information
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
