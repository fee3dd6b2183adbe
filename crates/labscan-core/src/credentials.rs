//! Credential store and remote shell authentication strategies
//!
//! Credentials are cached per device in `credentials.json`, keyed
//! `"<device_key>:<kind>"`. The store uses the same atomic replace as the
//! identity cache. Reads are lock-free snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cache::{load_json_or_default, write_atomic, CacheError};
use crate::device::{DeviceCandidate, DeviceKey};

/// File name of the credential store inside the cache directory
pub const CREDENTIAL_STORE_FILE: &str = "credentials.json";

/// Default private keys tried for public-key authentication
const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_rsa"];

/// What a cached credential is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Ssh,
}

impl CredentialKind {
    fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Ssh => "ssh",
        }
    }
}

/// Username/password pair cached for a device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn store_key(device: &DeviceKey, kind: CredentialKind) -> String {
    format!("{}:{}", device, kind.as_str())
}

/// Persistent per-device credential cache
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::open(dir.join(CREDENTIAL_STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of all cached credentials
    pub fn load(&self) -> BTreeMap<String, StoredCredential> {
        load_json_or_default(&self.path)
    }

    pub fn get(&self, device: &DeviceKey, kind: CredentialKind) -> Option<StoredCredential> {
        self.load().remove(&store_key(device, kind))
    }

    /// Cache a username (and optional password) for a device
    pub fn cache_credential(
        &self,
        device: &DeviceKey,
        kind: CredentialKind,
        username: &str,
        password: Option<String>,
    ) -> Result<(), CacheError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut credentials = self.load();
        credentials.insert(
            store_key(device, kind),
            StoredCredential {
                username: username.to_string(),
                password,
            },
        );
        let content = serde_json::to_vec_pretty(&credentials)?;
        write_atomic(&self.path, &content)?;

        info!(device = %device, kind = kind.as_str(), username = %username, "Cached credentials");
        Ok(())
    }
}

/// System-wide fallback credentials and key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultCredentials {
    pub username: String,
    pub password: Option<String>,
    /// Private keys offered for public-key auth. Empty means the ssh
    /// client's own defaults and agent.
    pub key_files: Vec<PathBuf>,
}

impl Default for DefaultCredentials {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: None,
            key_files: default_key_files(),
        }
    }
}

/// Existing private keys in `~/.ssh`, in preference order
pub fn default_key_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    DEFAULT_KEY_NAMES
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.exists())
        .collect()
}

/// Credentials passed by the caller for a single operation
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ExplicitCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for ExplicitCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplicitCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where a password strategy came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit,
    Cached,
    SystemDefault,
}

/// One way of authenticating a remote shell session
#[derive(Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    PublicKey {
        username: String,
        identity_files: Vec<PathBuf>,
    },
    Password {
        username: String,
        password: String,
        source: CredentialSource,
    },
}

impl AuthStrategy {
    pub fn username(&self) -> &str {
        match self {
            AuthStrategy::PublicKey { username, .. } | AuthStrategy::Password { username, .. } => {
                username
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthStrategy::PublicKey { .. } => "publickey",
            AuthStrategy::Password {
                source: CredentialSource::Explicit,
                ..
            } => "password(explicit)",
            AuthStrategy::Password {
                source: CredentialSource::Cached,
                ..
            } => "password(cached)",
            AuthStrategy::Password {
                source: CredentialSource::SystemDefault,
                ..
            } => "password(default)",
        }
    }
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.label(), self.username())
    }
}

/// Builds the ordered authentication chain for a device
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    store: Arc<CredentialStore>,
    defaults: DefaultCredentials,
}

impl CredentialResolver {
    pub fn new(store: Arc<CredentialStore>, defaults: DefaultCredentials) -> Self {
        Self { store, defaults }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn defaults(&self) -> &DefaultCredentials {
        &self.defaults
    }

    /// Ordered strategies to try for one probe attempt.
    ///
    /// 1. public key as the explicit, configured, or default user
    /// 2. the cached username/password for this device
    /// 3. public key as the configured device user
    /// 4. the system-wide default username/password
    ///
    /// An explicit password is tried before all of them.
    pub fn strategies(
        &self,
        candidate: &DeviceCandidate,
        explicit: Option<&ExplicitCredentials>,
    ) -> Vec<AuthStrategy> {
        let explicit_user = explicit.and_then(|e| e.username.clone());
        let primary_user = explicit_user
            .clone()
            .or_else(|| candidate.username.clone())
            .unwrap_or_else(|| self.defaults.username.clone());

        let mut chain = Vec::new();

        if let Some(password) = explicit.and_then(|e| e.password.clone()) {
            chain.push(AuthStrategy::Password {
                username: primary_user.clone(),
                password,
                source: CredentialSource::Explicit,
            });
        }

        chain.push(self.public_key(&primary_user));

        if let Some(cached) = self.store.get(&candidate.device_key, CredentialKind::Ssh) {
            match cached.password {
                Some(password) => chain.push(AuthStrategy::Password {
                    username: cached.username,
                    password,
                    source: CredentialSource::Cached,
                }),
                None => chain.push(self.public_key(&cached.username)),
            }
        }

        if let Some(device_user) = &candidate.username {
            chain.push(self.public_key(device_user));
        }

        if let Some(password) = &self.defaults.password {
            chain.push(AuthStrategy::Password {
                username: self.defaults.username.clone(),
                password: password.clone(),
                source: CredentialSource::SystemDefault,
            });
        }

        let mut unique: Vec<AuthStrategy> = Vec::with_capacity(chain.len());
        for strategy in chain {
            if !unique.contains(&strategy) {
                unique.push(strategy);
            }
        }

        debug!(device = %candidate.device_key, chain = ?unique, "Resolved auth strategies");
        unique
    }

    /// Username and password to use when installing a public key
    pub fn install_credentials(
        &self,
        candidate: &DeviceCandidate,
        explicit: &ExplicitCredentials,
    ) -> (String, Option<String>) {
        let cached = self.store.get(&candidate.device_key, CredentialKind::Ssh);
        let username = explicit
            .username
            .clone()
            .or_else(|| cached.as_ref().map(|c| c.username.clone()))
            .or_else(|| candidate.username.clone())
            .unwrap_or_else(|| self.defaults.username.clone());
        let password = explicit
            .password
            .clone()
            .or_else(|| cached.and_then(|c| c.password))
            .or_else(|| self.defaults.password.clone());
        (username, password)
    }

    /// Public half of the first configured key, if present on disk
    pub fn public_key_file(&self) -> Option<PathBuf> {
        self.defaults
            .key_files
            .iter()
            .map(|key| {
                let mut name = key.clone().into_os_string();
                name.push(".pub");
                PathBuf::from(name)
            })
            .find(|path| path.exists())
    }

    fn public_key(&self, username: &str) -> AuthStrategy {
        AuthStrategy::PublicKey {
            username: username.to_string(),
            identity_files: self.defaults.key_files.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CandidateOrigin;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn candidate(username: Option<&str>) -> DeviceCandidate {
        DeviceCandidate {
            device_key: DeviceKey::new("devA"),
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            username: username.map(str::to_string),
            origin: CandidateOrigin::Configured,
        }
    }

    fn resolver(dir: &TempDir, password: Option<&str>) -> CredentialResolver {
        CredentialResolver::new(
            Arc::new(CredentialStore::in_dir(dir.path())),
            DefaultCredentials {
                username: "fio".to_string(),
                password: password.map(str::to_string),
                key_files: vec![PathBuf::from("/keys/id_ed25519")],
            },
        )
    }

    #[test]
    fn test_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let key = DeviceKey::new("device1");

        assert!(store.get(&key, CredentialKind::Ssh).is_none());
        store
            .cache_credential(&key, CredentialKind::Ssh, "root", Some("secret".to_string()))
            .unwrap();

        let cred = store.get(&key, CredentialKind::Ssh).unwrap();
        assert_eq!(cred.username, "root");
        assert_eq!(cred.password.as_deref(), Some("secret"));
        assert!(store.get(&DeviceKey::new("device2"), CredentialKind::Ssh).is_none());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("device1:ssh"));
    }

    #[test]
    fn test_invalid_store_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        std::fs::write(store.path(), "invalid json{").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_full_chain_order() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, Some("fio"));
        resolver
            .store()
            .cache_credential(
                &DeviceKey::new("devA"),
                CredentialKind::Ssh,
                "admin",
                Some("cached-pw".to_string()),
            )
            .unwrap();

        let explicit = ExplicitCredentials {
            username: Some("tester".to_string()),
            password: None,
        };
        let chain = resolver.strategies(&candidate(Some("root")), Some(&explicit));
        let labels: Vec<String> = chain.iter().map(|s| format!("{:?}", s)).collect();
        assert_eq!(
            labels,
            vec![
                "publickey@tester",
                "password(cached)@admin",
                "publickey@root",
                "password(default)@fio",
            ]
        );
    }

    #[test]
    fn test_chain_collapses_duplicates() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, None);

        // Configured user is both the primary and the device-level user
        let chain = resolver.strategies(&candidate(Some("root")), None);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].username(), "root");

        // Without a configured user the system default is used for keys
        let chain = resolver.strategies(&candidate(None), None);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].username(), "fio");
    }

    #[test]
    fn test_explicit_password_goes_first() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, None);
        let explicit = ExplicitCredentials {
            username: None,
            password: Some("pw".to_string()),
        };
        let chain = resolver.strategies(&candidate(Some("root")), Some(&explicit));
        assert!(matches!(
            &chain[0],
            AuthStrategy::Password { username, source: CredentialSource::Explicit, .. } if username == "root"
        ));
        assert!(matches!(chain[1], AuthStrategy::PublicKey { .. }));
    }

    #[test]
    fn test_install_credentials_fall_back_to_cache() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir, None);
        resolver
            .store()
            .cache_credential(
                &DeviceKey::new("devA"),
                CredentialKind::Ssh,
                "admin",
                Some("cached-pw".to_string()),
            )
            .unwrap();

        let (user, password) =
            resolver.install_credentials(&candidate(Some("root")), &ExplicitCredentials::default());
        assert_eq!(user, "admin");
        assert_eq!(password.as_deref(), Some("cached-pw"));
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let strategy = AuthStrategy::Password {
            username: "root".to_string(),
            password: "hunter2".to_string(),
            source: CredentialSource::Cached,
        };
        assert!(!format!("{:?}", strategy).contains("hunter2"));

        let cred = StoredCredential {
            username: "root".to_string(),
            password: Some("hunter2".to_string()),
        };
        assert!(!format!("{:?}", cred).contains("hunter2"));
    }
}
