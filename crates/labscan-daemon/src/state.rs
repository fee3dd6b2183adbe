//! Application state shared by the CLI and the HTTP API

use anyhow::Context;
use labscan_core::{
    CacheError, CandidateOrigin, CredentialKind, CredentialResolver, CredentialStore,
    DeviceCandidate, DeviceIdentity, DeviceKey, ExplicitCredentials, IdentityCache, PowerTopology,
};
use labscan_discovery::{
    DiscoveryError, DiscoveryReport, DiscoveryRequest, DiscoveryScheduler, IpVerification,
    NetworkProber, Prober,
};
use labscan_probe::{InstrumentProbe, KeyInstall, ProbeError, RemoteCommandProbe, SwitchProbe};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{load_config, Config};
use crate::listing::{DeviceListing, ListQuery};

/// Upper bound for `ssh-copy-id`, which needs several round trips
const INSTALL_KEY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Device not found: {0}")]
    NotFound(DeviceKey),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StateResult<T> = Result<T, StateError>;

/// Remote shell pieces rebuilt on reload
#[derive(Clone)]
struct RemoteAccess {
    probe: RemoteCommandProbe,
    resolver: CredentialResolver,
}

/// Shared application state
pub struct AppState {
    scheduler: DiscoveryScheduler,
    cache: Arc<IdentityCache>,
    credentials: Arc<CredentialStore>,
    remote: RwLock<RemoteAccess>,
    config: RwLock<Config>,
    config_path: PathBuf,
    /// `--target-network` / `LABSCAN_TARGET_NETWORK`, re-applied on reload
    target_override: Option<String>,
}

impl AppState {
    /// Create state probing the real network
    pub fn new(
        config: Config,
        config_path: PathBuf,
        target_override: Option<String>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::build(config, config_path, target_override, None)
    }

    /// Create state with a caller-supplied prober
    pub fn with_prober(
        config: Config,
        config_path: PathBuf,
        prober: Arc<dyn Prober>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::build(config, config_path, None, Some(prober))
    }

    fn build(
        config: Config,
        config_path: PathBuf,
        target_override: Option<String>,
        prober: Option<Arc<dyn Prober>>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = config.with_target_network(target_override.clone());
        config.validate()?;

        let cache_dir = config.cache_dir();
        let cache = Arc::new(
            IdentityCache::in_dir(&cache_dir)
                .with_context(|| format!("Failed to open cache in {}", cache_dir.display()))?,
        );
        let credentials = Arc::new(CredentialStore::in_dir(&cache_dir));
        let remote = remote_access(&config, credentials.clone());
        let prober = match prober {
            Some(prober) => prober,
            None => network_prober(&config, &remote)?,
        };

        let scheduler = DiscoveryScheduler::new(config.to_scheduler_config()?, cache.clone(), prober);

        info!(
            cache = %cache.path().display(),
            devices = config.devices.len(),
            target = %config.discovery.target_network,
            "Application state ready"
        );

        Ok(Arc::new(Self {
            scheduler,
            cache,
            credentials,
            remote: RwLock::new(remote),
            config: RwLock::new(config),
            config_path,
            target_override,
        }))
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Device listing, probing first unless the query asks for the cache
    pub async fn list(&self, query: &ListQuery) -> StateResult<DeviceListing> {
        let mut records = match query.mode.discovery_mode() {
            None => self.scheduler.snapshot().await?,
            Some(mode) => {
                let request = DiscoveryRequest {
                    mode,
                    force_refresh: query.force,
                    ..Default::default()
                };
                self.scheduler.run(request).await?.devices
            }
        };
        self.apply_topology(&mut records).await;
        Ok(query.apply(records))
    }

    /// Cached record for one device
    pub async fn device(&self, key: &DeviceKey) -> StateResult<DeviceIdentity> {
        let mut records = self.scheduler.snapshot().await?;
        self.apply_topology(&mut records).await;
        records
            .into_iter()
            .find(|record| &record.device_key == key)
            .ok_or_else(|| StateError::NotFound(key.clone()))
    }

    /// Force re-verification of the given devices
    pub async fn refresh(
        &self,
        keys: Vec<DeviceKey>,
        credentials: Option<ExplicitCredentials>,
    ) -> StateResult<DiscoveryReport> {
        let request = DiscoveryRequest {
            credentials,
            ..DiscoveryRequest::verify(keys)
        };
        let mut report = self.scheduler.run(request).await?;
        self.apply_topology(&mut report.devices).await;
        Ok(report)
    }

    /// Full discovery cycle including the subnet sweep
    pub async fn discover(&self, force_refresh: bool) -> StateResult<DiscoveryReport> {
        let request = DiscoveryRequest {
            force_refresh,
            ..DiscoveryRequest::full()
        };
        let mut report = self.scheduler.run(request).await?;
        self.apply_topology(&mut report.devices).await;
        Ok(report)
    }

    /// Identify whichever device answers at an address and record it there
    pub async fn verify_ip(
        &self,
        ip: Ipv4Addr,
        credentials: Option<ExplicitCredentials>,
    ) -> StateResult<IpVerification> {
        let mut verification = self.scheduler.verify_ip(ip, credentials).await?;
        if let (Some(key), Some(_)) = (&verification.device_key, &verification.record) {
            // Power links depend on the other records
            verification.record = Some(self.device(key).await?);
        }
        Ok(verification)
    }

    /// Set or clear a friendly name
    pub async fn rename(&self, key: DeviceKey, name: Option<String>) -> StateResult<DeviceIdentity> {
        let cache = self.cache.clone();
        let record = blocking(move || cache.set_friendly_name(&key, name)).await??;
        Ok(record)
    }

    /// Set or clear the switch controlling a device
    pub async fn link(
        &self,
        key: DeviceKey,
        switch: Option<DeviceKey>,
    ) -> StateResult<DeviceIdentity> {
        if switch.as_ref() == Some(&key) {
            return Err(StateError::Invalid(format!(
                "{} cannot control itself",
                key
            )));
        }
        let cache = self.cache.clone();
        let record = blocking(move || cache.set_controlled_by(&key, switch)).await??;
        Ok(record)
    }

    /// Remember a username (and optionally password) for a device
    pub async fn cache_credential(
        &self,
        key: DeviceKey,
        username: String,
        password: Option<String>,
    ) -> StateResult<()> {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(StateError::Invalid("username must not be empty".to_string()));
        }
        let store = self.credentials.clone();
        blocking(move || store.cache_credential(&key, CredentialKind::Ssh, &username, password))
            .await??;
        Ok(())
    }

    /// Install the local public key on a device for password-less login
    pub async fn install_key(
        &self,
        key: DeviceKey,
        explicit: ExplicitCredentials,
    ) -> StateResult<KeyInstall> {
        let candidate = self.candidate(&key).await?;
        let remote = self.remote.read().await.clone();

        let resolver = remote.resolver.clone();
        let for_resolver = candidate.clone();
        let (username, password, public_key) = blocking(move || {
            let (username, password) = resolver.install_credentials(&for_resolver, &explicit);
            (username, password, resolver.public_key_file())
        })
        .await?;
        let public_key = public_key.ok_or_else(|| {
            StateError::Invalid("no public key found next to the configured key files".to_string())
        })?;

        let outcome = remote
            .probe
            .install_public_key(
                candidate.ip,
                &username,
                password.as_deref(),
                &remote.resolver.defaults().key_files,
                &public_key,
                INSTALL_KEY_TIMEOUT,
            )
            .await?;

        // Later probes should log in as the same user
        let store = self.credentials.clone();
        if let Err(e) = blocking(move || {
            store.cache_credential(&key, CredentialKind::Ssh, &username, password)
        })
        .await?
        {
            warn!(error = %e, "Failed to cache credentials after key install");
        }

        Ok(outcome)
    }

    /// Power control relationships over the current cache
    pub async fn topology(&self) -> StateResult<PowerTopology> {
        let records = self.scheduler.snapshot().await?;
        let explicit = self.config.read().await.explicit_links();
        Ok(PowerTopology::from_identities(&records, &explicit))
    }

    /// Re-read the configuration file and swap the discovery settings
    pub async fn reload(&self) -> StateResult<Config> {
        let config = load_config(&self.config_path)?.with_target_network(self.target_override.clone());
        config.validate()?;

        if config.cache_dir() != self.config.read().await.cache_dir() {
            warn!("cache_dir changed; restart to switch stores");
        }

        let remote = remote_access(&config, self.credentials.clone());
        let prober = network_prober(&config, &remote)?;
        self.scheduler.update_settings(config.to_scheduler_config()?).await;
        self.scheduler.update_prober(prober).await;
        *self.remote.write().await = remote;
        *self.config.write().await = config.clone();

        info!(path = %self.config_path.display(), "Configuration reloaded");
        Ok(config)
    }

    async fn apply_topology(&self, records: &mut [DeviceIdentity]) {
        let explicit = self.config.read().await.explicit_links();
        PowerTopology::from_identities(records, &explicit).apply(records);
    }

    /// Address and username for a device; a configured address wins over
    /// the cached one
    async fn candidate(&self, key: &DeviceKey) -> StateResult<DeviceCandidate> {
        let configured = self.config.read().await.device(key).cloned();

        let cache = self.cache.clone();
        let lookup = key.clone();
        let cached_ip = blocking(move || cache.get(&lookup)).await?.and_then(|record| record.ip);

        let candidate = match configured {
            Some(device) => device.ip.or(cached_ip).map(|ip| DeviceCandidate {
                device_key: key.clone(),
                ip,
                username: device.username,
                origin: CandidateOrigin::Configured,
            }),
            None => cached_ip.map(|ip| DeviceCandidate {
                device_key: key.clone(),
                ip,
                username: None,
                origin: CandidateOrigin::Cached,
            }),
        };
        candidate.ok_or_else(|| StateError::NotFound(key.clone()))
    }
}

fn remote_access(config: &Config, store: Arc<CredentialStore>) -> RemoteAccess {
    RemoteAccess {
        probe: RemoteCommandProbe::new(config.discovery.ssh_port),
        resolver: CredentialResolver::new(store, config.credentials.to_defaults()),
    }
}

fn network_prober(config: &Config, remote: &RemoteAccess) -> anyhow::Result<Arc<dyn Prober>> {
    let switch = SwitchProbe::new(config.discovery.http_port)
        .context("Failed to build HTTP client for switch probing")?;
    let instrument = InstrumentProbe::new(config.discovery.instrument_ports.clone());
    Ok(Arc::new(NetworkProber::new(
        remote.probe.clone(),
        switch,
        instrument,
        remote.resolver.clone(),
    )))
}

/// Run a file-backed operation on the blocking pool
async fn blocking<T, F>(f: F) -> StateResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StateError::Discovery(DiscoveryError::Task(e)))
}
