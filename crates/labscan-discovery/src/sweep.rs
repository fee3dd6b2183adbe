//! Bounded host sweep of the target range (ARP table plus ping)

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

/// `ping` processes run at once when `fping` is missing
const PING_CONCURRENCY: usize = 32;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Invalid target range '{0}'")]
    InvalidRange(String),
    #[error("Failed to run {0}: {1}")]
    Command(&'static str, #[source] std::io::Error),
}

/// IPv4 network to sweep, written `a.b.c.d/len`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetRange {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl TargetRange {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, SweepError> {
        if prefix_len > 32 {
            return Err(SweepError::InvalidRange(format!("{}/{}", addr, prefix_len)));
        }
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask(prefix_len)),
            prefix_len,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => (u32::from(v4) & mask(self.prefix_len)) == u32::from(self.network),
            IpAddr::V6(_) => false,
        }
    }

    /// Number of usable host addresses
    pub fn host_count(&self) -> u64 {
        match self.prefix_len {
            32 => 1,
            31 => 2,
            len => (1u64 << (32 - len)) - 2,
        }
    }

    /// Usable host addresses, at most `limit` of them
    pub fn hosts(&self, limit: usize) -> Vec<Ipv4Addr> {
        let network = u32::from(self.network);
        let broadcast = network | !mask(self.prefix_len);
        let (first, last) = match self.prefix_len {
            32 | 31 => (network, broadcast),
            // Skip network and broadcast addresses
            _ => (network + 1, broadcast - 1),
        };
        (first..=last).take(limit).map(Ipv4Addr::from).collect()
    }
}

impl FromStr for TargetRange {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SweepError::InvalidRange(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().map_err(|_| invalid())?),
            None => (s.trim(), 32),
        };
        let addr = Ipv4Addr::from_str(addr).map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TargetRange {
    type Error = SweepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetRange> for String {
    fn from(range: TargetRange) -> Self {
        range.to_string()
    }
}

impl std::fmt::Display for TargetRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        0xFFFFFFFF
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    }
}

/// Neighbour table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub interface: String,
    pub state: ArpState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    Unknown,
}

impl ArpState {
    /// Entry points at a host that answered recently
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ArpState::Reachable | ArpState::Stale | ArpState::Delay | ArpState::Permanent
        )
    }
}

/// Current neighbour table from `ip neigh show`
pub async fn get_arp_table() -> Result<Vec<ArpEntry>, SweepError> {
    let output = Command::new("ip")
        .args(["neigh", "show"])
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SweepError::Command("ip", e))?;

    if !output.status.success() {
        warn!(
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Failed to read neighbour table"
        );
        return Ok(Vec::new());
    }

    let entries: Vec<ArpEntry> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ip_neigh_line)
        .collect();

    debug!("Found {} ARP entries", entries.len());
    Ok(entries)
}

/// Parse a line such as `192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE`
fn parse_ip_neigh_line(line: &str) -> Option<ArpEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    let ip = Ipv4Addr::from_str(parts[0]).ok()?;
    let dev_idx = parts.iter().position(|&p| p == "dev")?;
    let interface = parts.get(dev_idx + 1)?.to_string();

    // No lladdr on INCOMPLETE/FAILED entries
    let mac = parts
        .iter()
        .position(|&p| p == "lladdr")
        .and_then(|idx| parts.get(idx + 1))
        .map(|s| s.to_string())
        .unwrap_or_default();

    let state = match parts.last().map(|s| s.to_uppercase()).as_deref() {
        Some("REACHABLE") => ArpState::Reachable,
        Some("STALE") => ArpState::Stale,
        Some("DELAY") => ArpState::Delay,
        Some("PROBE") => ArpState::Probe,
        Some("FAILED") => ArpState::Failed,
        Some("INCOMPLETE") => ArpState::Incomplete,
        Some("PERMANENT") => ArpState::Permanent,
        _ => ArpState::Unknown,
    };

    Some(ArpEntry {
        ip,
        mac,
        interface,
        state,
    })
}

/// Live neighbour table entries inside `range`, at most `limit` of them
fn live_neighbours(entries: &[ArpEntry], range: &TargetRange, limit: usize) -> Vec<Ipv4Addr> {
    entries
        .iter()
        .filter(|entry| entry.state.is_live() && range.contains(IpAddr::V4(entry.ip)))
        .inspect(|entry| {
            trace!(ip = %entry.ip, mac = %entry.mac, interface = %entry.interface, "Live neighbour")
        })
        .map(|entry| entry.ip)
        .take(limit)
        .collect()
}

/// Hosts in `range` that look alive, at most `max_hosts` of them.
///
/// Live neighbour table entries are taken as-is; the rest of the range is
/// pinged with `fping` when installed, else with a bounded number of
/// `ping` processes. Hosts found before `timeout` runs out are kept.
pub async fn sweep(range: &TargetRange, max_hosts: usize, timeout: Duration) -> Vec<Ipv4Addr> {
    let deadline = Instant::now() + timeout;
    let mut alive = BTreeSet::new();

    match timeout_at(deadline, get_arp_table()).await {
        Ok(Ok(entries)) => alive.extend(live_neighbours(&entries, range, max_hosts)),
        Ok(Err(e)) => debug!(error = %e, "Neighbour table unavailable"),
        Err(_) => warn!("Reading the neighbour table exceeded the sweep budget"),
    }

    if range.host_count() > max_hosts as u64 {
        warn!(
            range = %range,
            hosts = range.host_count(),
            limit = max_hosts,
            "Target range larger than sweep limit, truncating"
        );
    }
    let targets: Vec<Ipv4Addr> = range
        .hosts(max_hosts)
        .into_iter()
        .filter(|ip| !alive.contains(ip))
        .take(max_hosts.saturating_sub(alive.len()))
        .collect();

    debug!(range = %range, arp_hits = alive.len(), ping_targets = targets.len(), "Sweeping target range");

    alive.extend(ping_hosts(&targets, deadline).await);
    alive.into_iter().collect()
}

async fn ping_hosts(hosts: &[Ipv4Addr], deadline: Instant) -> Vec<Ipv4Addr> {
    if hosts.is_empty() {
        return Vec::new();
    }
    match timeout_at(deadline, scan_with_fping(hosts)).await {
        Ok(Ok(reachable)) => reachable,
        Ok(Err(e)) => {
            trace!(error = %e, "fping unavailable, falling back to ping");
            scan_hosts(hosts, PING_CONCURRENCY, deadline, ping_once).await
        }
        Err(_) => {
            warn!(hosts = hosts.len(), "fping exceeded the sweep budget");
            Vec::new()
        }
    }
}

async fn scan_with_fping(hosts: &[Ipv4Addr]) -> Result<Vec<Ipv4Addr>, SweepError> {
    let output = Command::new("fping")
        .args(["-a", "-q", "-r", "1", "-t", "200"])
        .args(hosts.iter().map(|h| h.to_string()))
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SweepError::Command("fping", e))?;

    let reachable: Vec<Ipv4Addr> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| Ipv4Addr::from_str(line.trim()).ok())
        .collect();

    debug!("fping found {} reachable hosts", reachable.len());
    Ok(reachable)
}

async fn ping_once(host: Ipv4Addr) -> bool {
    Command::new("ping")
        .args(["-c", "1", "-W", "1", &host.to_string()])
        .kill_on_drop(true)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Check hosts with at most `limit` checks in flight.
///
/// Checks still pending at `deadline` are aborted; hosts already found are
/// returned.
async fn scan_hosts<F, Fut>(
    hosts: &[Ipv4Addr],
    limit: usize,
    deadline: Instant,
    check: F,
) -> Vec<Ipv4Addr>
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: Future<Output = bool> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();

    for &host in hosts {
        let semaphore = semaphore.clone();
        let check = check(host);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            check.await.then_some(host)
        });
    }

    let mut reachable = Vec::new();
    loop {
        match timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok(Some(host)))) => reachable.push(host),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!(
                    pending = tasks.len(),
                    found = reachable.len(),
                    "Ping sweep exceeded its time budget, keeping hosts found so far"
                );
                // Dropping the set aborts the pending checks
                break;
            }
        }
    }

    debug!("ping found {} reachable hosts", reachable.len());
    reachable
}
