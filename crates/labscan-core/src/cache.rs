//! Durable identity cache with serialized read-merge-write
//!
//! The cache is a single JSON document holding one [`DeviceIdentity`] per
//! device key. Every mutation goes through one process-wide critical section
//! that re-reads the store, applies the change, and atomically replaces the
//! file. Readers never take the lock: the store file is only ever replaced
//! by rename, so a reader sees either the previous or the next complete
//! version.
//!
//! Merging a probe outcome follows these rules:
//! - identity fields are only overwritten by non-empty values
//! - `ssh_status` and `last_attempt` always take the patch's values
//! - `last_seen` and `ip` only move on a successful identification
//! - `friendly_name` and `controlled_by` are left to their own setters
//! - a patch older than the record's `last_attempt` is dropped as stale

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{non_empty, DeviceIdentity, DeviceKey, IdentityPatch};

/// File name of the identity store inside the cache directory
pub const IDENTITY_STORE_FILE: &str = "identities.json";

fn default_version() -> String {
    "1".to_string()
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to replace store file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// On-disk layout of the identity store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityStore {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub devices: BTreeMap<DeviceKey, DeviceIdentity>,
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self {
            version: default_version(),
            devices: BTreeMap::new(),
        }
    }
}

/// Result of merging a patch into the cache
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Patch was applied; carries the updated record
    Applied(DeviceIdentity),
    /// Patch was older than the stored attempt and was dropped; carries the
    /// unchanged record
    Stale(DeviceIdentity),
}

impl MergeOutcome {
    pub fn record(&self) -> &DeviceIdentity {
        match self {
            MergeOutcome::Applied(r) | MergeOutcome::Stale(r) => r,
        }
    }

    pub fn into_record(self) -> DeviceIdentity {
        match self {
            MergeOutcome::Applied(r) | MergeOutcome::Stale(r) => r,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, MergeOutcome::Stale(_))
    }
}

/// Apply a probe patch to a record. Returns false if the patch is stale.
pub fn merge_patch(record: &mut DeviceIdentity, patch: &IdentityPatch) -> bool {
    if let Some(current) = record.last_attempt {
        if patch.attempted_at < current {
            return false;
        }
    }

    if let Some(hostname) = non_empty(patch.hostname.as_deref()) {
        record.hostname = Some(hostname.to_string());
    }
    if let Some(unique_id) = non_empty(patch.unique_id.as_deref()) {
        record.unique_id = Some(unique_id.to_string());
    }
    if let Some(firmware) = non_empty(patch.firmware_version.as_deref()) {
        record.firmware_version = Some(firmware.to_string());
    }
    record.kind.merge_from(&patch.kind);

    record.ssh_status = patch.ssh_status;
    record.last_attempt = Some(patch.attempted_at);

    if patch.identified {
        record.last_seen = Some(patch.attempted_at);
    }
    if let Some(ip) = patch.ip {
        if patch.identified || record.ip.is_none() {
            record.ip = Some(ip);
        }
    }

    true
}

/// Persistent identity cache
#[derive(Debug)]
pub struct IdentityCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IdentityCache {
    /// Open (or prepare) a cache backed by the given store file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            ensure_private_dir(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Open the default store file inside a cache directory
    pub fn in_dir(dir: &Path) -> Result<Self, CacheError> {
        Self::open(dir.join(IDENTITY_STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every cached record, ordered by key
    pub fn get_all(&self) -> Vec<DeviceIdentity> {
        self.load().devices.into_values().collect()
    }

    /// Snapshot of a single record
    pub fn get(&self, key: &DeviceKey) -> Option<DeviceIdentity> {
        self.load().devices.remove(key)
    }

    /// Merge a probe outcome into the record for `key`, creating it if needed
    pub fn merge(&self, key: &DeviceKey, patch: &IdentityPatch) -> Result<MergeOutcome, CacheError> {
        let mut applied = false;
        let record = self.update(key, |record| {
            applied = merge_patch(record, patch);
            applied
        })?;

        if applied {
            Ok(MergeOutcome::Applied(record))
        } else {
            debug!(
                device = %key,
                patch_attempt = %patch.attempted_at,
                record_attempt = ?record.last_attempt,
                "Dropped stale identity patch"
            );
            Ok(MergeOutcome::Stale(record))
        }
    }

    /// Set or clear the user-assigned label
    pub fn set_friendly_name(
        &self,
        key: &DeviceKey,
        name: Option<String>,
    ) -> Result<DeviceIdentity, CacheError> {
        let name = name.and_then(|n| non_empty(Some(&n)).map(str::to_string));
        let record = self.update(key, |record| {
            if record.friendly_name == name {
                return false;
            }
            record.friendly_name = name.clone();
            true
        })?;
        info!(device = %key, name = ?record.friendly_name, "Updated friendly name");
        Ok(record)
    }

    /// Set or clear the controlling power switch
    pub fn set_controlled_by(
        &self,
        key: &DeviceKey,
        switch: Option<DeviceKey>,
    ) -> Result<DeviceIdentity, CacheError> {
        let record = self.update(key, |record| {
            if record.controlled_by == switch {
                return false;
            }
            record.controlled_by = switch.clone();
            true
        })?;
        info!(device = %key, switch = ?record.controlled_by, "Updated power switch link");
        Ok(record)
    }

    /// Read-modify-write one record inside the critical section. The closure
    /// returns whether it changed anything; unchanged stores are not rewritten.
    fn update<F>(&self, key: &DeviceKey, apply: F) -> Result<DeviceIdentity, CacheError>
    where
        F: FnOnce(&mut DeviceIdentity) -> bool,
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut store = self.load();
        let is_new = !store.devices.contains_key(key);
        let record = store
            .devices
            .entry(key.clone())
            .or_insert_with(|| DeviceIdentity::new(key.clone()));

        let changed = apply(record);
        let result = record.clone();

        if changed || is_new {
            self.save(&store)?;
        }
        Ok(result)
    }

    fn load(&self) -> IdentityStore {
        load_json_or_default(&self.path)
    }

    fn save(&self, store: &IdentityStore) -> Result<(), CacheError> {
        let content = serde_json::to_vec_pretty(store)?;
        write_atomic(&self.path, &content)
    }
}

/// Read a JSON document, falling back to the default value when the file is
/// missing, unreadable or corrupt. A corrupt file is copied aside to
/// `<name>.bak` before being ignored.
pub(crate) fn load_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read store, using empty store");
            return T::default();
        }
    };

    if content.trim().is_empty() {
        return T::default();
    }

    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Store is corrupt, using empty store");
            let backup = path.with_extension("json.bak");
            match std::fs::copy(path, &backup) {
                Ok(_) => info!(backup = %backup.display(), "Backed up corrupt store"),
                Err(e) => debug!(error = %e, "Could not back up corrupt store"),
            }
            T::default()
        }
    }
}

/// Write `content` to a temp file in the target's directory, flush it to
/// disk, and rename it over the target.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<(), CacheError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_private_dir(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path)?;
    Ok(())
}

fn ensure_private_dir(dir: &Path) -> Result<(), std::io::Error> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, PowerState, SshStatus};
    use chrono::{DateTime, Duration, Utc};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ip(last: u8) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    fn success(at: DateTime<Utc>, hostname: &str, address: u8) -> IdentityPatch {
        IdentityPatch {
            attempted_at: at,
            ip: ip(address),
            identified: true,
            hostname: Some(hostname.to_string()),
            unique_id: Some(format!("{}-serial", hostname)),
            firmware_version: Some("Linux 6.6".to_string()),
            kind: DeviceKind::Generic,
            ssh_status: SshStatus::Ok,
        }
    }

    fn open_cache(dir: &TempDir) -> IdentityCache {
        IdentityCache::in_dir(dir.path()).unwrap()
    }

    #[test]
    fn test_first_success_creates_single_record() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let key = DeviceKey::new("devA");

        let outcome = cache.merge(&key, &success(Utc::now(), "board1", 5)).unwrap();
        assert!(!outcome.is_stale());

        let all = cache.get_all();
        assert_eq!(all.len(), 1);
        let record = &all[0];
        assert_eq!(record.device_key, key);
        assert_eq!(record.hostname.as_deref(), Some("board1"));
        assert_eq!(record.ssh_status, SshStatus::Ok);
        assert_eq!(record.kind, DeviceKind::Generic);
        assert_eq!(record.ip, ip(5));
        assert!(record.last_seen.is_some());
    }

    #[test]
    fn test_failed_probe_keeps_identity_fields() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let key = DeviceKey::new("devB");
        let t0 = Utc::now();

        cache.merge(&key, &success(t0, "boardB", 6)).unwrap();
        let t1 = t0 + Duration::seconds(30);
        let failed = IdentityPatch::failed(ip(99), SshStatus::Timeout, t1);
        let record = cache.merge(&key, &failed).unwrap().into_record();

        assert_eq!(record.hostname.as_deref(), Some("boardB"));
        assert_eq!(record.unique_id.as_deref(), Some("boardB-serial"));
        assert_eq!(record.kind, DeviceKind::Generic);
        assert_eq!(record.ssh_status, SshStatus::Timeout);
        assert_eq!(record.last_attempt, Some(t1));
        assert_eq!(record.last_seen, Some(t0));
        // A failed observation never re-homes the device
        assert_eq!(record.ip, ip(6));
    }

    #[test]
    fn test_stale_patch_is_dropped() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let key = DeviceKey::new("devC");
        let t0 = Utc::now();

        cache.merge(&key, &success(t0, "fresh", 7)).unwrap();
        let older = success(t0 - Duration::seconds(5), "old-name", 8);
        let outcome = cache.merge(&key, &older).unwrap();

        assert!(outcome.is_stale());
        let record = cache.get(&key).unwrap();
        assert_eq!(record.hostname.as_deref(), Some("fresh"));
        assert_eq!(record.ip, ip(7));
        assert_eq!(record.last_attempt, Some(t0));
    }

    #[test]
    fn test_merge_order_consistent_with_timestamps_converges() {
        let t0 = Utc::now();
        let patches = vec![
            success(t0, "first", 1),
            IdentityPatch::failed(ip(1), SshStatus::Refused, t0 + Duration::seconds(1)),
            success(t0 + Duration::seconds(2), "second", 2),
        ];

        let mut in_order = DeviceIdentity::new(DeviceKey::new("k"));
        for p in &patches {
            assert!(merge_patch(&mut in_order, p));
        }

        // Out-of-order arrivals are rejected and leave the same result
        let mut shuffled = DeviceIdentity::new(DeviceKey::new("k"));
        assert!(merge_patch(&mut shuffled, &patches[0]));
        assert!(merge_patch(&mut shuffled, &patches[2]));
        assert!(!merge_patch(&mut shuffled, &patches[1]));

        assert_eq!(in_order, shuffled);
        assert_eq!(in_order.hostname.as_deref(), Some("second"));
        assert_eq!(in_order.ip, ip(2));
    }

    #[test]
    fn test_dhcp_rehoming_on_success() {
        let mut record = DeviceIdentity::new(DeviceKey::new("devD"));
        let t0 = Utc::now();
        merge_patch(&mut record, &success(t0, "board", 10));
        merge_patch(&mut record, &success(t0 + Duration::seconds(1), "board", 11));
        assert_eq!(record.ip, ip(11));
    }

    #[test]
    fn test_probe_merge_never_touches_name_or_link() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let key = DeviceKey::new("devE");

        cache
            .set_friendly_name(&key, Some("Bench board".to_string()))
            .unwrap();
        cache
            .set_controlled_by(&key, Some(DeviceKey::new("sw1")))
            .unwrap();
        let record = cache
            .merge(&key, &success(Utc::now(), "board-e", 12))
            .unwrap()
            .into_record();

        assert_eq!(record.friendly_name.as_deref(), Some("Bench board"));
        assert_eq!(record.controlled_by, Some(DeviceKey::new("sw1")));
        assert_eq!(record.hostname.as_deref(), Some("board-e"));

        let cleared = cache.set_friendly_name(&key, Some("  ".to_string())).unwrap();
        assert_eq!(cleared.friendly_name, None);
        assert_eq!(cleared.hostname.as_deref(), Some("board-e"));
    }

    #[test]
    fn test_switch_reading_merges_fieldwise() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let key = DeviceKey::new("sw1");
        let t0 = Utc::now();

        let mut patch = success(t0, "tasmota-1", 9);
        patch.kind = DeviceKind::PowerSwitch {
            power_state: Some(PowerState::On),
            power_watts: Some(4.2),
            load_name: None,
        };
        cache.merge(&key, &patch).unwrap();

        let mut later = success(t0 + Duration::seconds(1), "tasmota-1", 9);
        later.kind = DeviceKind::PowerSwitch {
            power_state: Some(PowerState::On),
            power_watts: None,
            load_name: None,
        };
        let record = cache.merge(&key, &later).unwrap().into_record();
        assert_eq!(record.power_watts(), Some(4.2));
        assert_eq!(record.power_state(), Some(PowerState::On));
    }

    #[test]
    fn test_corrupt_store_falls_back_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(IDENTITY_STORE_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        let cache = IdentityCache::open(&path).unwrap();
        assert!(cache.get_all().is_empty());
        assert!(dir.path().join("identities.json.bak").exists());

        // The next merge replaces the corrupt file with a valid store
        cache
            .merge(&DeviceKey::new("devA"), &success(Utc::now(), "board1", 5))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let store: IdentityStore = serde_json::from_str(&content).unwrap();
        assert_eq!(store.devices.len(), 1);
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let key = DeviceKey::new("devA");
        {
            let cache = open_cache(&dir);
            cache.merge(&key, &success(Utc::now(), "board1", 5)).unwrap();
        }
        let reopened = open_cache(&dir);
        assert_eq!(
            reopened.get(&key).and_then(|r| r.hostname),
            Some("board1".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        cache
            .merge(&DeviceKey::new("devA"), &success(Utc::now(), "board1", 5))
            .unwrap();
        let mode = std::fs::metadata(cache.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_concurrent_merges_lose_no_updates() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open_cache(&dir));
        let base = Utc::now();
        let cycles = 8;
        let keys = 4;

        let handles: Vec<_> = (0..cycles)
            .map(|cycle| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for k in 0..keys {
                        let key = DeviceKey::new(format!("dev{}", k));
                        let at = base + Duration::seconds(cycle as i64);
                        let patch = if cycle % 2 == 0 {
                            success(at, &format!("host-{}-{}", k, cycle), k as u8 + 1)
                        } else {
                            IdentityPatch::failed(ip(k as u8 + 1), SshStatus::Refused, at)
                        };
                        cache.merge(&key, &patch).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let all = cache.get_all();
        assert_eq!(all.len(), keys);
        let latest = base + Duration::seconds(cycles as i64 - 1);
        for (k, record) in all.iter().enumerate() {
            // The newest attempt can never be stale, so its status always lands
            assert_eq!(record.last_attempt, Some(latest));
            assert_eq!(record.ssh_status, SshStatus::Refused);

            // Identity fields and last_seen always come from the same
            // successful cycle, whichever one was accepted last
            let seen = record.last_seen.expect("a successful cycle was merged");
            let cycle = (seen - base).num_seconds();
            assert_eq!(cycle % 2, 0);
            assert_eq!(
                record.hostname.as_deref(),
                Some(format!("host-{}-{}", k, cycle).as_str())
            );
        }
    }

    #[test]
    fn test_concurrent_merges_keep_latest_success() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open_cache(&dir));
        let base = Utc::now();
        let key = DeviceKey::new("devA");

        let handles: Vec<_> = (0..16)
            .map(|cycle| {
                let cache = cache.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    let at = base + Duration::seconds(cycle);
                    cache
                        .merge(&key, &success(at, &format!("host-{}", cycle), 1))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = cache.get(&key).unwrap();
        assert_eq!(record.hostname.as_deref(), Some("host-15"));
        assert_eq!(record.last_seen, Some(base + Duration::seconds(15)));
    }
}
