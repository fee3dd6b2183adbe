//! Discovery scheduler: picks stale devices, probes them in parallel under a
//! cycle budget and merges the results into the identity cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labscan_core::{
    AuthStrategy, CacheError, CandidateOrigin, ConfiguredDevice, CredentialResolver,
    DeviceCandidate, DeviceIdentity, DeviceKey, DeviceType, ExplicitCredentials, IdentityCache,
    IdentityPatch, MergeOutcome, SshStatus,
};
use labscan_probe::{InstrumentProbe, ProbeError, RemoteCommandProbe, SwitchProbe};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, ProbeSet};
use crate::sweep::{self, TargetRange};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Background task failed: {0}")]
    Task(#[from] JoinError),
}

/// Scheduler settings, swapped as a whole on reload
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Entries whose last attempt is older than this are re-probed
    pub staleness_secs: i64,
    /// Maximum candidates probed at once
    pub concurrency: usize,
    /// Hard timeout of each individual probe
    pub probe_timeout: Duration,
    /// Time allowed for a full cycle
    pub cycle_budget: Duration,
    /// Time allowed for a quick cycle
    pub quick_budget: Duration,
    /// Range swept in full mode
    pub target: Option<TargetRange>,
    pub max_sweep_hosts: usize,
    /// Statically configured devices
    pub devices: Vec<ConfiguredDevice>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 300,
            concurrency: 4,
            probe_timeout: Duration::from_secs(5),
            cycle_budget: Duration::from_secs(120),
            quick_budget: Duration::from_secs(5),
            target: None,
            max_sweep_hosts: 254,
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Cached devices only, short budget
    #[default]
    Quick,
    /// Configured and cached devices plus a sweep of the target range
    Full,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryRequest {
    pub mode: DiscoveryMode,
    /// Probe every selected candidate regardless of staleness
    pub force_refresh: bool,
    /// Restrict the cycle to these devices. Empty means all.
    pub keys: Vec<DeviceKey>,
    pub credentials: Option<ExplicitCredentials>,
}

impl DiscoveryRequest {
    pub fn quick() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            mode: DiscoveryMode::Full,
            ..Default::default()
        }
    }

    /// Force re-verification of specific devices
    pub fn verify(keys: Vec<DeviceKey>) -> Self {
        Self {
            mode: DiscoveryMode::Full,
            force_refresh: true,
            keys,
            credentials: None,
        }
    }
}

/// Counts over a set of identity records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub total: usize,
    pub by_type: BTreeMap<DeviceType, usize>,
    pub by_ssh_status: BTreeMap<SshStatus, usize>,
    /// `online` / `offline`
    pub by_status: BTreeMap<String, usize>,
}

impl DeviceSummary {
    pub fn of(records: &[DeviceIdentity]) -> Self {
        let mut summary = DeviceSummary {
            total: records.len(),
            ..Default::default()
        };
        for record in records {
            *summary.by_type.entry(record.device_type()).or_default() += 1;
            *summary.by_ssh_status.entry(record.ssh_status).or_default() += 1;
            let status = if record.is_online() { "online" } else { "offline" };
            *summary.by_status.entry(status.to_string()).or_default() += 1;
        }
        summary
    }
}

/// An address claimed by more than one device key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConflict {
    pub ip: IpAddr,
    /// Key that was just identified at the address
    pub claimed_by: DeviceKey,
    /// Keys whose last-known address is the same
    pub also_held_by: Vec<DeviceKey>,
}

/// A device answered at an address with another device's hardware id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMismatch {
    pub ip: IpAddr,
    /// Key that was expected at the address
    pub expected: DeviceKey,
    pub expected_unique_id: String,
    pub found_unique_id: String,
    /// Key the answer was stored under instead
    pub stored_as: DeviceKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub mode: DiscoveryMode,
    pub devices: Vec<DeviceIdentity>,
    pub summary: DeviceSummary,
    pub probed: usize,
    pub served_from_cache: usize,
    /// Probes still running when the cycle budget expired
    pub abandoned: usize,
    /// Results older than what the cache already held
    pub stale_dropped: usize,
    pub ip_conflicts: Vec<IpConflict>,
    /// Answers that did not match the hardware id cached for the key
    pub identity_mismatches: Vec<IdentityMismatch>,
    pub completed_at: DateTime<Utc>,
}

/// Which device, if any, answers at an address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpVerification {
    pub ip: IpAddr,
    /// Whether any probe identified the host
    pub identified: bool,
    pub unique_id: Option<String>,
    /// Key the answer was stored under; none without a hardware id
    pub device_key: Option<DeviceKey>,
    /// The hardware id already belonged to a cached device
    pub known: bool,
    /// Address the device was cached at before, when it moved
    pub previous_ip: Option<IpAddr>,
    pub record: Option<DeviceIdentity>,
}

/// Network access used by the scheduler
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Run every probe against one candidate
    async fn probe(
        &self,
        candidate: &DeviceCandidate,
        credentials: Option<&ExplicitCredentials>,
        timeout: Duration,
    ) -> ProbeSet;

    /// Addresses in the range that look alive
    async fn sweep(&self, range: &TargetRange, max_hosts: usize, timeout: Duration) -> Vec<Ipv4Addr>;
}

/// Prober backed by the real network probes
pub struct NetworkProber {
    remote: RemoteCommandProbe,
    switch: SwitchProbe,
    instrument: InstrumentProbe,
    resolver: CredentialResolver,
}

impl NetworkProber {
    pub fn new(
        remote: RemoteCommandProbe,
        switch: SwitchProbe,
        instrument: InstrumentProbe,
        resolver: CredentialResolver,
    ) -> Self {
        Self {
            remote,
            switch,
            instrument,
            resolver,
        }
    }
}

/// Strategies from the resolver task; if the task failed, the remote shell
/// is tried without a login
fn resolved_strategies(
    result: Result<Vec<AuthStrategy>, JoinError>,
    device: &DeviceKey,
) -> Vec<AuthStrategy> {
    result.unwrap_or_else(|e| {
        warn!(
            device = %device,
            error = %e,
            "Failed to resolve credentials, trying without login"
        );
        Vec::new()
    })
}

/// Bound a probe future by its own hard timeout
async fn bounded<T>(
    timeout: Duration,
    probe: impl std::future::Future<Output = Result<T, ProbeError>>,
) -> Result<T, ProbeError> {
    tokio::time::timeout(timeout, probe)
        .await
        .unwrap_or(Err(ProbeError::Timeout))
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(
        &self,
        candidate: &DeviceCandidate,
        credentials: Option<&ExplicitCredentials>,
        timeout: Duration,
    ) -> ProbeSet {
        // The credential store is a file read
        let resolver = self.resolver.clone();
        let for_resolver = candidate.clone();
        let explicit = credentials.cloned();
        let strategies = tokio::task::spawn_blocking(move || {
            resolver.strategies(&for_resolver, explicit.as_ref())
        })
        .await;
        let strategies = resolved_strategies(strategies, &candidate.device_key);

        let ip = candidate.ip;
        let (remote, switch, instrument) = tokio::join!(
            bounded(timeout, self.remote.probe(ip, &strategies, timeout)),
            bounded(timeout, self.switch.probe(ip, timeout)),
            bounded(timeout, self.instrument.probe(ip, timeout)),
        );

        ProbeSet {
            remote,
            switch,
            instrument,
        }
    }

    async fn sweep(&self, range: &TargetRange, max_hosts: usize, timeout: Duration) -> Vec<Ipv4Addr> {
        sweep::sweep(range, max_hosts, timeout).await
    }
}

/// Key a probed candidate's result is stored under.
///
/// Swept hosts are keyed by their learned hardware id, else provisionally
/// by address. Every other candidate keeps its key.
pub fn assign_key(candidate: &DeviceCandidate, patch: &IdentityPatch) -> DeviceKey {
    match (candidate.origin, patch.unique_id.as_deref().map(str::trim)) {
        (CandidateOrigin::Swept, Some(id)) if !id.is_empty() => DeviceKey::from_unique_id(id),
        _ => candidate.device_key.clone(),
    }
}

/// Cached record already holding a hardware id. Keys chosen by the user
/// win over keys derived from the id.
fn holder_of<'a>(
    unique_id: &str,
    records: impl Iterator<Item = &'a DeviceIdentity>,
) -> Option<&'a DeviceIdentity> {
    let derived = DeviceKey::from_unique_id(unique_id);
    records
        .filter(|record| {
            record.device_key == derived
                || record
                    .unique_id
                    .as_deref()
                    .is_some_and(|id| DeviceKey::from_unique_id(id) == derived)
        })
        .min_by_key(|record| record.device_key == derived)
}

/// Results of one cycle as they are merged
#[derive(Default)]
struct CycleState {
    latest: HashMap<DeviceKey, DeviceIdentity>,
    stale_dropped: usize,
    ip_conflicts: Vec<IpConflict>,
    identity_mismatches: Vec<IdentityMismatch>,
}

/// Whether a cached entry needs probing this cycle
pub fn needs_probe(
    record: Option<&DeviceIdentity>,
    force_refresh: bool,
    now: DateTime<Utc>,
    staleness_secs: i64,
) -> bool {
    match record {
        _ if force_refresh => true,
        None => true,
        Some(record) => record.ssh_status != SshStatus::Ok || record.is_stale(now, staleness_secs),
    }
}

/// Discovery scheduler service
pub struct DiscoveryScheduler {
    config: Arc<RwLock<SchedulerConfig>>,
    cache: Arc<IdentityCache>,
    prober: RwLock<Arc<dyn Prober>>,
}

impl DiscoveryScheduler {
    pub fn new(config: SchedulerConfig, cache: Arc<IdentityCache>, prober: Arc<dyn Prober>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            cache,
            prober: RwLock::new(prober),
        }
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Replace the scheduler settings; takes effect on the next cycle
    pub async fn update_settings(&self, config: SchedulerConfig) {
        info!(
            devices = config.devices.len(),
            target = ?config.target.map(|t| t.to_string()),
            concurrency = config.concurrency,
            "Discovery settings updated"
        );
        *self.config.write().await = config;
    }

    /// Replace the network access used from the next cycle on
    pub async fn update_prober(&self, prober: Arc<dyn Prober>) {
        *self.prober.write().await = prober;
    }

    pub async fn settings(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Cache snapshot without probing
    pub async fn snapshot(&self) -> Result<Vec<DeviceIdentity>, DiscoveryError> {
        let cache = self.cache.clone();
        Ok(tokio::task::spawn_blocking(move || cache.get_all()).await?)
    }

    /// Run one discovery cycle
    pub async fn run(&self, request: DiscoveryRequest) -> Result<DiscoveryReport, DiscoveryError> {
        let config = self.config.read().await.clone();
        let prober = self.prober.read().await.clone();
        let budget = match request.mode {
            DiscoveryMode::Quick => config.quick_budget,
            DiscoveryMode::Full => config.cycle_budget,
        };
        let deadline = Instant::now() + budget;
        let probe_timeout = config.probe_timeout.min(budget);
        let now = Utc::now();

        info!(
            mode = ?request.mode,
            force = request.force_refresh,
            keys = request.keys.len(),
            "Starting discovery cycle"
        );

        let records = self.snapshot().await?;
        let candidates = candidates(prober.as_ref(), &config, &request, &records).await;

        let (to_probe, from_cache): (Vec<DeviceCandidate>, Vec<DeviceCandidate>) = {
            let cached: HashMap<&DeviceKey, &DeviceIdentity> =
                records.iter().map(|r| (&r.device_key, r)).collect();
            candidates.into_iter().partition(|candidate| {
                needs_probe(
                    cached.get(&candidate.device_key).copied(),
                    request.force_refresh,
                    now,
                    config.staleness_secs,
                )
            })
        };

        debug!(
            probe = to_probe.len(),
            cached = from_cache.len(),
            "Selected discovery candidates"
        );

        let probed = to_probe.len();
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for candidate in to_probe {
            let semaphore = semaphore.clone();
            let prober = prober.clone();
            let credentials = request.credentials.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let attempted_at = Utc::now();
                let probes = prober
                    .probe(&candidate, credentials.as_ref(), probe_timeout)
                    .await;
                let patch = classify(&candidate, &probes, attempted_at);
                Some((candidate, patch))
            });
        }

        let mut cycle = CycleState {
            latest: records
                .into_iter()
                .map(|r| (r.device_key.clone(), r))
                .collect(),
            ..Default::default()
        };
        let mut abandoned = 0;

        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(Some((candidate, patch))))) => {
                    self.record(&candidate, patch, &mut cycle).await?;
                }
                Ok(Some(Ok(None))) => {}
                Ok(Some(Err(e))) => warn!(error = %e, "Probe task failed"),
                Ok(None) => break,
                Err(_) => {
                    abandoned = tasks.len();
                    warn!(
                        abandoned,
                        budget_secs = budget.as_secs_f64(),
                        "Discovery cycle budget expired, abandoning outstanding probes"
                    );
                    // Queued tasks fail to get a permit and never start
                    semaphore.close();
                    // Late results are dropped with the detached tasks
                    tasks.detach_all();
                    break;
                }
            }
        }

        let mut devices = self.snapshot().await?;
        if !request.keys.is_empty() {
            let rerouted: Vec<&DeviceKey> = cycle
                .identity_mismatches
                .iter()
                .map(|m| &m.stored_as)
                .collect();
            devices.retain(|record| {
                request.keys.contains(&record.device_key) || rerouted.contains(&&record.device_key)
            });
        }

        let report = DiscoveryReport {
            mode: request.mode,
            summary: DeviceSummary::of(&devices),
            devices,
            probed,
            served_from_cache: from_cache.len(),
            abandoned,
            stale_dropped: cycle.stale_dropped,
            ip_conflicts: cycle.ip_conflicts,
            identity_mismatches: cycle.identity_mismatches,
            completed_at: Utc::now(),
        };

        info!(
            total = report.summary.total,
            probed = report.probed,
            cached = report.served_from_cache,
            abandoned = report.abandoned,
            "Discovery cycle complete"
        );
        Ok(report)
    }

    /// Probe one address and store the answer under the device holding
    /// the hardware id it reports.
    ///
    /// Hosts that do not report a hardware id are not stored.
    pub async fn verify_ip(
        &self,
        ip: Ipv4Addr,
        credentials: Option<ExplicitCredentials>,
    ) -> Result<IpVerification, DiscoveryError> {
        let config = self.config.read().await.clone();
        let prober = self.prober.read().await.clone();
        let records = self.snapshot().await?;
        let address = IpAddr::V4(ip);

        let candidate = DeviceCandidate {
            device_key: DeviceKey::provisional(ip),
            ip: address,
            username: config
                .devices
                .iter()
                .find(|d| d.ip == Some(address))
                .and_then(|d| d.username.clone()),
            origin: CandidateOrigin::Swept,
        };
        let attempted_at = Utc::now();
        let probes = prober
            .probe(&candidate, credentials.as_ref(), config.probe_timeout)
            .await;
        let patch = classify(&candidate, &probes, attempted_at);

        let mut verification = IpVerification {
            ip: address,
            identified: patch.identified,
            unique_id: patch
                .unique_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            device_key: None,
            known: false,
            previous_ip: None,
            record: None,
        };
        let unique_id = match (&verification.unique_id, patch.identified) {
            (Some(id), true) => id.clone(),
            _ => {
                info!(ip = %ip, identified = patch.identified, "No hardware id at address");
                return Ok(verification);
            }
        };

        let key = match holder_of(&unique_id, records.iter()) {
            Some(holder) => {
                verification.known = true;
                verification.previous_ip = holder.ip.filter(|previous| *previous != address);
                holder.device_key.clone()
            }
            None => DeviceKey::from_unique_id(&unique_id),
        };
        if let Some(previous) = verification.previous_ip {
            info!(device = %key, from = %previous, to = %ip, "Device changed address");
        }

        match self.merge(&key, patch).await? {
            Ok(outcome) => verification.record = Some(outcome.into_record()),
            Err(e) => error!(device = %key, error = %e, "Failed to store probe result"),
        }
        verification.device_key = Some(key);
        Ok(verification)
    }

    /// Store one probe result, rerouting it when the device at the address
    /// is not the one cached under the candidate's key
    async fn record(
        &self,
        candidate: &DeviceCandidate,
        patch: IdentityPatch,
        cycle: &mut CycleState,
    ) -> Result<(), DiscoveryError> {
        let key = assign_key(candidate, &patch);

        let mismatch = cycle.latest.get(&key).and_then(|record| {
            let expected = record.unique_id_mismatch(&patch)?.to_string();
            let found = patch.unique_id.as_deref()?.trim().to_string();
            let stored_as = holder_of(&found, cycle.latest.values().filter(|r| r.device_key != key))
                .map(|holder| holder.device_key.clone())
                .unwrap_or_else(|| DeviceKey::from_unique_id(&found));
            Some(IdentityMismatch {
                ip: candidate.ip,
                expected: key.clone(),
                expected_unique_id: expected,
                found_unique_id: found,
                stored_as,
            })
        });

        let Some(mismatch) = mismatch else {
            return self.store(&key, patch, cycle).await;
        };

        warn!(
            ip = %mismatch.ip,
            device = %mismatch.expected,
            expected = %mismatch.expected_unique_id,
            found = %mismatch.found_unique_id,
            stored_as = %mismatch.stored_as,
            "Device at address has a different hardware id"
        );
        // The expected device was not verified; its identity stays as cached
        let unverified = IdentityPatch::failed(None, SshStatus::Unknown, patch.attempted_at);
        self.store(&key, unverified, cycle).await?;
        self.store(&mismatch.stored_as, patch, cycle).await?;
        cycle.identity_mismatches.push(mismatch);
        Ok(())
    }

    async fn store(
        &self,
        key: &DeviceKey,
        patch: IdentityPatch,
        cycle: &mut CycleState,
    ) -> Result<(), DiscoveryError> {
        match self.merge(key, patch).await? {
            Ok(MergeOutcome::Applied(record)) => {
                if let Some(conflict) = find_conflict(&record, &cycle.latest) {
                    warn!(
                        ip = %conflict.ip,
                        device = %conflict.claimed_by,
                        others = ?conflict.also_held_by,
                        "IP address conflict: two different devices claim same IP"
                    );
                    cycle.ip_conflicts.push(conflict);
                }
                cycle.latest.insert(key.clone(), record);
            }
            Ok(MergeOutcome::Stale(_)) => cycle.stale_dropped += 1,
            Err(e) => error!(device = %key, error = %e, "Failed to store probe result"),
        }
        Ok(())
    }

    async fn merge(
        &self,
        key: &DeviceKey,
        patch: IdentityPatch,
    ) -> Result<Result<MergeOutcome, CacheError>, DiscoveryError> {
        let cache = self.cache.clone();
        let key = key.clone();
        Ok(tokio::task::spawn_blocking(move || cache.merge(&key, &patch)).await?)
    }
}

/// Devices considered this cycle, before the staleness check
async fn candidates(
    prober: &dyn Prober,
    config: &SchedulerConfig,
    request: &DiscoveryRequest,
    records: &[DeviceIdentity],
) -> Vec<DeviceCandidate> {
    let configured_user = |key: &DeviceKey| {
        config
            .devices
            .iter()
            .find(|d| &d.device_key == key)
            .and_then(|d| d.username.clone())
    };
    let cached_ip = |key: &DeviceKey| {
        records
            .iter()
            .find(|r| &r.device_key == key)
            .and_then(|r| r.ip)
    };
    let from_record = |record: &DeviceIdentity| {
        // Unidentified swept hosts stay re-keyable
        let origin = if record.device_key.is_provisional() {
            CandidateOrigin::Swept
        } else {
            CandidateOrigin::Cached
        };
        record.ip.map(|ip| DeviceCandidate {
            device_key: record.device_key.clone(),
            ip,
            username: configured_user(&record.device_key),
            origin,
        })
    };

    if !request.keys.is_empty() {
        let mut selected = Vec::new();
        for key in &request.keys {
            let candidate = match config.devices.iter().find(|d| &d.device_key == key) {
                Some(device) => device.candidate(cached_ip(key)),
                None => records
                    .iter()
                    .find(|r| &r.device_key == key)
                    .and_then(from_record),
            };
            match candidate {
                Some(candidate) => selected.push(candidate),
                None => warn!(device = %key, "No known address, cannot re-verify"),
            }
        }
        return selected;
    }

    let mut selected: Vec<DeviceCandidate> = Vec::new();
    if request.mode == DiscoveryMode::Full {
        for device in &config.devices {
            match device.candidate(cached_ip(&device.device_key)) {
                Some(candidate) => selected.push(candidate),
                None => debug!(
                    device = %device.device_key,
                    "Configured without an address and not seen yet, skipping"
                ),
            }
        }
    }
    for record in records {
        if selected.iter().any(|c| c.device_key == record.device_key) {
            continue;
        }
        if let Some(candidate) = from_record(record) {
            selected.push(candidate);
        }
    }

    if request.mode == DiscoveryMode::Full {
        if let Some(range) = &config.target {
            let known: HashSet<IpAddr> = selected.iter().map(|c| c.ip).collect();
            let sweep_timeout = config.cycle_budget / 2;
            let hosts = prober
                .sweep(range, config.max_sweep_hosts, sweep_timeout)
                .await;
            let mut added = 0;
            for host in hosts {
                let ip = IpAddr::V4(host);
                if known.contains(&ip) {
                    continue;
                }
                selected.push(DeviceCandidate {
                    device_key: DeviceKey::provisional(host),
                    ip,
                    username: None,
                    origin: CandidateOrigin::Swept,
                });
                added += 1;
            }
            debug!(range = %range, new_hosts = added, "Sweep complete");
        }
    }

    selected
}

/// Other records whose last-known address equals a freshly identified one
fn find_conflict(
    record: &DeviceIdentity,
    latest: &HashMap<DeviceKey, DeviceIdentity>,
) -> Option<IpConflict> {
    let ip = record.ip?;
    if !record.is_online() {
        return None;
    }
    let mut others: Vec<DeviceKey> = latest
        .values()
        .filter(|other| other.device_key != record.device_key && other.ip == Some(ip))
        .map(|other| other.device_key.clone())
        .collect();
    if others.is_empty() {
        return None;
    }
    others.sort();
    Some(IpConflict {
        ip,
        claimed_by: record.device_key.clone(),
        also_held_by: others,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use labscan_core::{DeviceKind, PowerState};
    use labscan_probe::{RemoteIdentity, SwitchStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted prober that records every address it touches
    #[derive(Default)]
    struct FakeProber {
        answers: HashMap<IpAddr, ProbeSet>,
        sweep_hosts: Vec<Ipv4Addr>,
        slow: HashSet<IpAddr>,
        probed: Mutex<Vec<IpAddr>>,
        swept: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeProber {
        fn answer(mut self, ip: IpAddr, probes: ProbeSet) -> Self {
            self.answers.insert(ip, probes);
            self
        }

        fn probed(&self) -> Vec<IpAddr> {
            let mut probed = self.probed.lock().unwrap().clone();
            probed.sort();
            probed
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(
            &self,
            candidate: &DeviceCandidate,
            _credentials: Option<&ExplicitCredentials>,
            _timeout: Duration,
        ) -> ProbeSet {
            self.probed.lock().unwrap().push(candidate.ip);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = if self.slow.contains(&candidate.ip) {
                Duration::from_secs(3)
            } else {
                Duration::from_millis(20)
            };
            tokio::time::sleep(delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.answers
                .get(&candidate.ip)
                .cloned()
                .unwrap_or_else(|| ProbeSet::unreachable(ProbeError::Timeout))
        }

        async fn sweep(&self, _range: &TargetRange, max_hosts: usize, _timeout: Duration) -> Vec<Ipv4Addr> {
            self.swept.fetch_add(1, Ordering::SeqCst);
            self.sweep_hosts.iter().copied().take(max_hosts).collect()
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn shell(hostname: &str, unique_id: &str) -> ProbeSet {
        ProbeSet {
            remote: Ok(RemoteIdentity {
                hostname: Some(hostname.to_string()),
                unique_id: Some(unique_id.to_string()),
                os_release: Some("Linux-microPlatform 4.0.20".to_string()),
                username: "fio".to_string(),
            }),
            switch: Err(ProbeError::ProtocolMismatch("no".to_string())),
            instrument: Err(ProbeError::Unreachable("refused".to_string())),
        }
    }

    fn switch_answer() -> ProbeSet {
        ProbeSet {
            remote: Err(ProbeError::Unreachable("Connection refused".to_string())),
            switch: Ok(SwitchStatus {
                hostname: Some("tasmota-4B2C1A-3098".to_string()),
                mac: Some("A4:CF:12:4B:2C:1A".to_string()),
                firmware_version: Some("13.2.0(tasmota)".to_string()),
                load_name: Some("devA".to_string()),
                power_state: Some(PowerState::On),
                power_watts: Some(4.2),
            }),
            instrument: Err(ProbeError::Unreachable("refused".to_string())),
        }
    }

    fn configured(key: &str, last: u8) -> ConfiguredDevice {
        ConfiguredDevice {
            device_key: DeviceKey::new(key),
            ip: Some(ip(last)),
            username: Some("fio".to_string()),
        }
    }

    fn config(devices: Vec<ConfiguredDevice>) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: 2,
            probe_timeout: Duration::from_secs(1),
            cycle_budget: Duration::from_secs(10),
            quick_budget: Duration::from_secs(5),
            target: Some("10.0.0.0/24".parse().unwrap()),
            devices,
            ..Default::default()
        }
    }

    fn scheduler(dir: &TempDir, config: SchedulerConfig, prober: Arc<FakeProber>) -> DiscoveryScheduler {
        let cache = Arc::new(IdentityCache::in_dir(dir.path()).unwrap());
        DiscoveryScheduler::new(config, cache, prober)
    }

    fn seed(scheduler: &DiscoveryScheduler, key: &str, last: u8, status: SshStatus, age_secs: i64) {
        let at = Utc::now() - chrono::Duration::seconds(age_secs);
        let mut patch = IdentityPatch::failed(Some(ip(last)), status, at);
        if status == SshStatus::Ok {
            patch.identified = true;
            patch.kind = DeviceKind::Generic;
            patch.hostname = Some(format!("{}-host", key));
        }
        scheduler.cache().merge(&DeviceKey::new(key), &patch).unwrap();
    }

    /// Identified device with a known hardware id
    fn seed_identified(scheduler: &DiscoveryScheduler, key: &str, last: u8, unique_id: &str) {
        let mut patch = IdentityPatch::failed(Some(ip(last)), SshStatus::Ok, Utc::now());
        patch.identified = true;
        patch.kind = DeviceKind::Generic;
        patch.hostname = Some(format!("{}-host", key));
        patch.unique_id = Some(unique_id.to_string());
        scheduler.cache().merge(&DeviceKey::new(key), &patch).unwrap();
    }

    #[test]
    fn test_needs_probe() {
        let now = Utc::now();
        let mut record = DeviceIdentity::new(DeviceKey::new("devA"));
        record.ssh_status = SshStatus::Ok;
        record.last_attempt = Some(now - chrono::Duration::seconds(10));

        assert!(needs_probe(None, false, now, 300));
        assert!(!needs_probe(Some(&record), false, now, 300));
        assert!(needs_probe(Some(&record), true, now, 300));
        assert!(needs_probe(Some(&record), false, now, 5));

        record.ssh_status = SshStatus::Timeout;
        assert!(needs_probe(Some(&record), false, now, 300));
    }

    #[test]
    fn test_assign_key() {
        let mut patch = IdentityPatch::failed(Some(ip(50)), SshStatus::Ok, Utc::now());
        let swept = DeviceCandidate {
            device_key: DeviceKey::provisional(Ipv4Addr::new(10, 0, 0, 50)),
            ip: ip(50),
            username: None,
            origin: CandidateOrigin::Swept,
        };
        assert_eq!(assign_key(&swept, &patch).as_str(), "ip-10-0-0-50");

        patch.unique_id = Some("A4:CF:12:4B:2C:1A".to_string());
        assert_eq!(assign_key(&swept, &patch).as_str(), "hw-a4cf124b2c1a");
        let configured = configured("devA", 5).candidate(None).unwrap();
        assert_eq!(assign_key(&configured, &patch).as_str(), "devA");
    }

    #[tokio::test]
    async fn test_failed_credential_lookup_falls_back() {
        let device = DeviceKey::new("devA");
        let failed = tokio::spawn(async { panic!("credential store unreadable") })
            .await
            .map(|()| Vec::new());
        assert!(resolved_strategies(failed, &device).is_empty());

        let strategy = AuthStrategy::Password {
            username: "fio".to_string(),
            password: "fio".to_string(),
            source: labscan_core::CredentialSource::SystemDefault,
        };
        let resolved = resolved_strategies(Ok(vec![strategy.clone()]), &device);
        assert!(resolved == vec![strategy]);
    }

    #[tokio::test]
    async fn test_quick_mode_never_touches_unknown_addresses() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber {
            sweep_hosts: vec![Ipv4Addr::new(10, 0, 0, 77)],
            ..Default::default()
        }
        .answer(ip(5), shell("board1", "serial-a")));
        let scheduler = scheduler(&dir, config(vec![configured("devNew", 6)]), prober.clone());
        seed(&scheduler, "devA", 5, SshStatus::Timeout, 30);

        let report = scheduler.run(DiscoveryRequest::quick()).await.unwrap();

        assert_eq!(prober.probed(), vec![ip(5)]);
        assert_eq!(prober.swept.load(Ordering::SeqCst), 0);
        assert_eq!(report.probed, 1);
        assert_eq!(report.devices.len(), 1);
        assert_eq!(report.devices[0].hostname.as_deref(), Some("board1"));
        assert_eq!(report.devices[0].ssh_status, SshStatus::Ok);
    }

    #[tokio::test]
    async fn test_fresh_entries_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default().answer(ip(5), shell("board1", "serial-a")));
        let scheduler = scheduler(&dir, config(Vec::new()), prober.clone());
        seed(&scheduler, "devA", 5, SshStatus::Ok, 10);
        seed(&scheduler, "devB", 6, SshStatus::AuthFailed, 10);
        seed(&scheduler, "devC", 7, SshStatus::Ok, 3600);

        let report = scheduler.run(DiscoveryRequest::quick()).await.unwrap();
        assert_eq!(prober.probed(), vec![ip(6), ip(7)]);
        assert_eq!(report.served_from_cache, 1);
        assert_eq!(report.probed, 2);

        let forced = DiscoveryRequest {
            force_refresh: true,
            ..DiscoveryRequest::quick()
        };
        let report = scheduler.run(forced).await.unwrap();
        assert_eq!(report.probed, 3);
        assert_eq!(report.served_from_cache, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_batch() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(
            FakeProber::default()
                .answer(ip(5), shell("board1", "serial-a"))
                .answer(ip(9), switch_answer()),
        );
        let devices = vec![configured("devA", 5), configured("devB", 6), configured("plug", 9)];
        let scheduler = scheduler(&dir, config(devices), prober.clone());

        let report = scheduler
            .run(DiscoveryRequest {
                mode: DiscoveryMode::Full,
                ..Default::default()
            })
            .await
            .unwrap();

        // The sweep found nothing new; all three configured devices are recorded
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.by_type.get(&DeviceType::Generic), Some(&1));
        assert_eq!(report.summary.by_type.get(&DeviceType::PowerSwitch), Some(&1));
        assert_eq!(report.summary.by_type.get(&DeviceType::Unknown), Some(&1));
        assert_eq!(report.summary.by_status.get("offline"), Some(&1));

        let dev_b = report.devices.iter().find(|d| d.device_key.as_str() == "devB").unwrap();
        assert_eq!(dev_b.ssh_status, SshStatus::Timeout);
        assert!(dev_b.last_attempt.is_some());
        assert!(dev_b.last_seen.is_none());

        let plug = report.devices.iter().find(|d| d.device_key.as_str() == "plug").unwrap();
        assert_eq!(plug.power_state(), Some(PowerState::On));
        assert_eq!(plug.power_watts(), Some(4.2));
        assert_eq!(plug.ssh_status, SshStatus::Refused);
    }

    #[tokio::test]
    async fn test_failed_reverification_keeps_identity() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default());
        let scheduler = scheduler(&dir, config(Vec::new()), prober.clone());
        seed(&scheduler, "devB", 6, SshStatus::Ok, 10);
        let before = scheduler.cache().get(&DeviceKey::new("devB")).unwrap();

        let report = scheduler
            .run(DiscoveryRequest::verify(vec![DeviceKey::new("devB")]))
            .await
            .unwrap();

        let after = &report.devices[0];
        assert_eq!(after.hostname.as_deref(), Some("devB-host"));
        assert_eq!(after.ssh_status, SshStatus::Timeout);
        assert_eq!(after.last_seen, before.last_seen);
        assert!(after.last_attempt > before.last_attempt);
        assert_eq!(after.ip, Some(ip(6)));
    }

    #[tokio::test]
    async fn test_verify_only_named_keys() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default().answer(ip(5), shell("board1", "serial-a")));
        let scheduler = scheduler(&dir, config(vec![configured("devA", 5)]), prober.clone());
        seed(&scheduler, "devA", 5, SshStatus::Ok, 1);
        seed(&scheduler, "devB", 6, SshStatus::Timeout, 1);

        let report = scheduler
            .run(DiscoveryRequest::verify(vec![
                DeviceKey::new("devA"),
                DeviceKey::new("missing"),
            ]))
            .await
            .unwrap();

        assert_eq!(prober.probed(), vec![ip(5)]);
        assert_eq!(prober.swept.load(Ordering::SeqCst), 0);
        assert_eq!(report.devices.len(), 1);
        assert_eq!(report.devices[0].device_key.as_str(), "devA");
    }

    #[tokio::test]
    async fn test_full_mode_keys_swept_hosts() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(
            FakeProber {
                sweep_hosts: vec![
                    Ipv4Addr::new(10, 0, 0, 5),
                    Ipv4Addr::new(10, 0, 0, 9),
                    Ipv4Addr::new(10, 0, 0, 40),
                ],
                ..Default::default()
            }
            .answer(ip(5), shell("board1", "serial-a"))
            .answer(ip(9), switch_answer()),
        );
        let scheduler = scheduler(&dir, config(vec![configured("devA", 5)]), prober.clone());

        let report = scheduler.run(DiscoveryRequest::full()).await.unwrap();

        // 10.0.0.5 belongs to the configured device and is probed once
        assert_eq!(prober.probed(), vec![ip(5), ip(9), ip(40)]);
        let keys: Vec<&str> = report.devices.iter().map(|d| d.device_key.as_str()).collect();
        assert_eq!(keys, vec!["devA", "hw-a4cf124b2c1a", "ip-10-0-0-40"]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default());
        let devices = (1..=8).map(|n| configured(&format!("dev{}", n), n)).collect();
        let scheduler = scheduler(&dir, config(devices), prober.clone());

        let report = scheduler
            .run(DiscoveryRequest {
                mode: DiscoveryMode::Full,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.probed, 8);
        assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_budget_expiry_abandons_slow_probes() {
        let dir = TempDir::new().unwrap();
        let mut prober = FakeProber::default().answer(ip(5), shell("board1", "serial-a"));
        prober.slow.insert(ip(6));
        let prober = Arc::new(prober);

        let mut settings = config(Vec::new());
        settings.quick_budget = Duration::from_millis(500);
        let scheduler = scheduler(&dir, settings, prober.clone());
        seed(&scheduler, "devA", 5, SshStatus::Timeout, 30);
        seed(&scheduler, "devB", 6, SshStatus::Timeout, 30);
        let before = scheduler.cache().get(&DeviceKey::new("devB")).unwrap();

        let started = std::time::Instant::now();
        let report = scheduler.run(DiscoveryRequest::quick()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.abandoned, 1);
        let dev_a = report.devices.iter().find(|d| d.device_key.as_str() == "devA").unwrap();
        assert_eq!(dev_a.ssh_status, SshStatus::Ok);
        let dev_b = report.devices.iter().find(|d| d.device_key.as_str() == "devB").unwrap();
        assert_eq!(dev_b.last_attempt, before.last_attempt);
    }

    #[tokio::test]
    async fn test_budget_expiry_stops_queued_work() {
        let dir = TempDir::new().unwrap();
        let mut prober = FakeProber::default();
        prober.slow.insert(ip(5));
        prober.slow.insert(ip(6));
        let prober = Arc::new(prober);

        let mut settings = config(Vec::new());
        settings.concurrency = 1;
        settings.quick_budget = Duration::from_millis(300);
        let scheduler = scheduler(&dir, settings, prober.clone());
        seed(&scheduler, "devA", 5, SshStatus::Timeout, 30);
        seed(&scheduler, "devB", 6, SshStatus::Timeout, 30);

        let report = scheduler.run(DiscoveryRequest::quick()).await.unwrap();
        assert_eq!(report.abandoned, 2);
        assert_eq!(prober.probed().len(), 1);

        // The queued device must not start once the cycle has returned
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(prober.probed().len(), 1);
    }

    #[tokio::test]
    async fn test_configured_device_without_address() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default().answer(ip(7), shell("board1", "serial-a")));
        let floating = |key: &str| ConfiguredDevice {
            device_key: DeviceKey::new(key),
            ip: None,
            username: Some("fio".to_string()),
        };
        let scheduler = scheduler(
            &dir,
            config(vec![floating("devA"), floating("devB")]),
            prober.clone(),
        );
        // devA was seen at .7 before; devB never was
        seed(&scheduler, "devA", 7, SshStatus::Timeout, 30);

        let report = scheduler
            .run(DiscoveryRequest {
                mode: DiscoveryMode::Full,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(prober.probed(), vec![ip(7)]);
        assert_eq!(report.probed, 1);
        let dev_a = report.devices.iter().find(|d| d.device_key.as_str() == "devA").unwrap();
        assert_eq!(dev_a.hostname.as_deref(), Some("board1"));
        assert!(report.devices.iter().all(|d| d.device_key.as_str() != "devB"));

        let report = scheduler
            .run(DiscoveryRequest::verify(vec![DeviceKey::new("devB")]))
            .await
            .unwrap();
        assert_eq!(report.probed, 0);
        assert!(report.devices.is_empty());
    }

    #[tokio::test]
    async fn test_swept_leftover_is_rekeyed() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default().answer(ip(40), shell("board9", "serial-z")));
        let scheduler = scheduler(&dir, config(Vec::new()), prober.clone());
        let leftover = DeviceKey::provisional(Ipv4Addr::new(10, 0, 0, 40));
        seed(&scheduler, leftover.as_str(), 40, SshStatus::Timeout, 30);

        scheduler.run(DiscoveryRequest::quick()).await.unwrap();

        let record = scheduler.cache().get(&DeviceKey::new("hw-serialz")).unwrap();
        assert_eq!(record.ip, Some(ip(40)));
        assert_eq!(record.hostname.as_deref(), Some("board9"));
    }

    #[tokio::test]
    async fn test_different_device_at_address_is_rerouted() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default().answer(ip(5), shell("board2", "serial-b")));
        let scheduler = scheduler(&dir, config(vec![configured("devA", 5)]), prober.clone());
        seed_identified(&scheduler, "devA", 5, "serial-a");

        let report = scheduler
            .run(DiscoveryRequest::verify(vec![DeviceKey::new("devA")]))
            .await
            .unwrap();

        assert_eq!(
            report.identity_mismatches,
            vec![IdentityMismatch {
                ip: ip(5),
                expected: DeviceKey::new("devA"),
                expected_unique_id: "serial-a".to_string(),
                found_unique_id: "serial-b".to_string(),
                stored_as: DeviceKey::new("hw-serialb"),
            }]
        );

        let dev_a = scheduler.cache().get(&DeviceKey::new("devA")).unwrap();
        assert_eq!(dev_a.unique_id.as_deref(), Some("serial-a"));
        assert_eq!(dev_a.hostname.as_deref(), Some("devA-host"));
        assert_eq!(dev_a.ssh_status, SshStatus::Unknown);
        assert!(!dev_a.is_online());

        let other = scheduler.cache().get(&DeviceKey::new("hw-serialb")).unwrap();
        assert_eq!(other.hostname.as_deref(), Some("board2"));
        assert_eq!(other.ip, Some(ip(5)));
        assert!(report.devices.iter().any(|d| d.device_key == other.device_key));
    }

    #[tokio::test]
    async fn test_swapped_addresses_follow_hardware_id() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default().answer(ip(5), shell("board-b", "serial-b")));
        let scheduler = scheduler(&dir, config(vec![configured("devA", 5)]), prober.clone());
        seed_identified(&scheduler, "devA", 5, "serial-a");
        seed_identified(&scheduler, "devB", 6, "SERIAL-B");

        let report = scheduler
            .run(DiscoveryRequest::verify(vec![DeviceKey::new("devA")]))
            .await
            .unwrap();

        assert_eq!(report.identity_mismatches.len(), 1);
        assert_eq!(report.identity_mismatches[0].stored_as, DeviceKey::new("devB"));
        let dev_b = scheduler.cache().get(&DeviceKey::new("devB")).unwrap();
        assert_eq!(dev_b.ip, Some(ip(5)));
        assert_eq!(dev_b.hostname.as_deref(), Some("board-b"));
        assert!(scheduler.cache().get(&DeviceKey::new("hw-serialb")).is_none());
    }

    #[tokio::test]
    async fn test_verify_ip() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(
            FakeProber::default()
                .answer(ip(8), shell("board1", "serial-a"))
                .answer(ip(9), switch_answer()),
        );
        let scheduler = scheduler(&dir, config(Vec::new()), prober.clone());
        seed_identified(&scheduler, "devA", 5, "serial-a");

        // devA moved from .5 to .8
        let moved = scheduler.verify_ip(Ipv4Addr::new(10, 0, 0, 8), None).await.unwrap();
        assert!(moved.identified);
        assert!(moved.known);
        assert_eq!(moved.device_key, Some(DeviceKey::new("devA")));
        assert_eq!(moved.previous_ip, Some(ip(5)));
        assert_eq!(moved.record.unwrap().ip, Some(ip(8)));

        let new = scheduler.verify_ip(Ipv4Addr::new(10, 0, 0, 9), None).await.unwrap();
        assert!(!new.known);
        assert_eq!(new.device_key, Some(DeviceKey::new("hw-a4cf124b2c1a")));
        assert_eq!(new.previous_ip, None);

        let nothing = scheduler.verify_ip(Ipv4Addr::new(10, 0, 0, 40), None).await.unwrap();
        assert!(!nothing.identified);
        assert_eq!(nothing.device_key, None);
        assert_eq!(scheduler.cache().get_all().len(), 2);
    }

    #[tokio::test]
    async fn test_ip_conflict_reported() {
        let dir = TempDir::new().unwrap();
        let prober = Arc::new(FakeProber::default().answer(ip(5), shell("board2", "serial-b")));
        let scheduler = scheduler(&dir, config(vec![configured("devNew", 5)]), prober.clone());
        seed(&scheduler, "devOld", 5, SshStatus::Ok, 10);

        let report = scheduler
            .run(DiscoveryRequest::verify(vec![DeviceKey::new("devNew")]))
            .await
            .unwrap();

        assert_eq!(report.ip_conflicts.len(), 1);
        assert_eq!(report.ip_conflicts[0].claimed_by.as_str(), "devNew");
        assert_eq!(report.ip_conflicts[0].also_held_by, vec![DeviceKey::new("devOld")]);

        // The older record keeps its address
        let old = scheduler.cache().get(&DeviceKey::new("devOld")).unwrap();
        assert_eq!(old.ip, Some(ip(5)));
    }

    #[tokio::test]
    async fn test_update_settings() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir, config(Vec::new()), Arc::new(FakeProber::default()));
        let mut settings = config(vec![configured("devA", 5)]);
        settings.concurrency = 8;
        scheduler.update_settings(settings).await;

        let current = scheduler.settings().await;
        assert_eq!(current.concurrency, 8);
        assert_eq!(current.devices.len(), 1);
    }
}
