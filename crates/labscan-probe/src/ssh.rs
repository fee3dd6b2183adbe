//! Remote shell identification through the system `ssh` client
//!
//! Password strategies run through `sshpass -e` so the password travels in
//! the environment, never on the command line. All strategies of one probe
//! share a single deadline and child processes are killed when it expires.

use labscan_core::AuthStrategy;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

use crate::error::ProbeError;

/// Default remote shell port
pub const SSH_PORT: u16 = 22;

/// Read-only identification script. Prints one `key=value` per line.
const IDENTIFY_SCRIPT: &str = "echo \"hostname=$(hostname 2>/dev/null || cat /etc/hostname 2>/dev/null)\"; \
echo \"serial=$(tr -d '\\000' < /proc/device-tree/serial-number 2>/dev/null)\"; \
echo \"machine_id=$(cat /etc/machine-id 2>/dev/null)\"; \
echo \"os=$(. /etc/os-release 2>/dev/null; echo \"$PRETTY_NAME\")\"";

/// `sshpass` exit status for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// What the identification script reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub hostname: Option<String>,
    /// Device tree serial number, else the machine id
    pub unique_id: Option<String>,
    /// `PRETTY_NAME` from os-release
    pub os_release: Option<String>,
    /// User the successful strategy logged in as
    pub username: String,
}

/// Result of a key installation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInstall {
    AlreadyInstalled,
    Installed,
}

/// Remote-command probe over the system `ssh` client
#[derive(Debug, Clone)]
pub struct RemoteCommandProbe {
    port: u16,
}

impl Default for RemoteCommandProbe {
    fn default() -> Self {
        Self::new(SSH_PORT)
    }
}

impl RemoteCommandProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Try each strategy in order until one identifies the host.
    ///
    /// Authentication failures move on to the next strategy. An unreachable
    /// host or an exhausted deadline ends the probe. When every strategy
    /// fails, the most informative failure is returned.
    pub async fn probe(
        &self,
        ip: IpAddr,
        strategies: &[AuthStrategy],
        timeout: Duration,
    ) -> Result<RemoteIdentity, ProbeError> {
        let deadline = Instant::now() + timeout;
        let mut failure: Option<ProbeError> = None;

        for strategy in strategies {
            trace!(ip = %ip, strategy = ?strategy, "Trying remote shell strategy");

            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut cmd = self.command(ip, strategy, IDENTIFY_SCRIPT, remaining);

            let result = timeout_at(deadline, cmd.output()).await;
            let error = match result {
                Err(_) => ProbeError::Timeout,
                Ok(Err(e)) => spawn_error(&cmd, e),
                Ok(Ok(output)) if output.status.success() => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    match parse_identity_output(&stdout, strategy.username()) {
                        Some(identity) => {
                            debug!(
                                ip = %ip,
                                strategy = ?strategy,
                                hostname = ?identity.hostname,
                                "Remote shell identified host"
                            );
                            return Ok(identity);
                        }
                        None => ProbeError::ProtocolMismatch(
                            "identification script printed nothing".to_string(),
                        ),
                    }
                }
                Ok(Ok(output)) => classify_ssh_failure(
                    output.status.code(),
                    &String::from_utf8_lossy(&output.stderr),
                ),
            };

            debug!(ip = %ip, strategy = ?strategy, error = %error, "Remote shell strategy failed");

            let stop = matches!(error, ProbeError::Unreachable(_) | ProbeError::Timeout);
            failure = Some(match failure {
                Some(previous) => previous.most_informative(error),
                None => error,
            });
            if stop {
                break;
            }
        }

        Err(failure.unwrap_or_else(|| {
            ProbeError::ProtocolMismatch("no authentication strategy available".to_string())
        }))
    }

    /// Whether key authentication already works for `username`
    pub async fn check_key_installed(
        &self,
        ip: IpAddr,
        username: &str,
        key_files: &[PathBuf],
        timeout: Duration,
    ) -> Result<bool, ProbeError> {
        let strategy = AuthStrategy::PublicKey {
            username: username.to_string(),
            identity_files: key_files.to_vec(),
        };
        let mut cmd = self.command(ip, &strategy, "true", timeout);

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        match result {
            Err(_) => Err(ProbeError::Timeout),
            Ok(Err(e)) => Err(spawn_error(&cmd, e)),
            Ok(Ok(output)) if output.status.success() => Ok(true),
            Ok(Ok(output)) => match classify_ssh_failure(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ) {
                ProbeError::AuthFailed(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    /// Copy a public key to the device using password authentication.
    ///
    /// Nothing is changed when key authentication already works.
    pub async fn install_public_key(
        &self,
        ip: IpAddr,
        username: &str,
        password: Option<&str>,
        key_files: &[PathBuf],
        public_key: &Path,
        timeout: Duration,
    ) -> Result<KeyInstall, ProbeError> {
        if self
            .check_key_installed(ip, username, key_files, timeout)
            .await?
        {
            info!(ip = %ip, username = %username, "Public key already installed");
            return Ok(KeyInstall::AlreadyInstalled);
        }

        let password = password.ok_or_else(|| {
            ProbeError::AuthFailed("no password available to install the key".to_string())
        })?;

        let mut cmd = Command::new("sshpass");
        cmd.arg("-e")
            .arg("ssh-copy-id")
            .args(common_options(timeout))
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-i")
            .arg(public_key)
            .arg(format!("{}@{}", username, ip))
            .env("SSHPASS", password)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        match result {
            Err(_) => Err(ProbeError::Timeout),
            Ok(Err(e)) => Err(spawn_error(&cmd, e)),
            Ok(Ok(output)) if output.status.success() => {
                info!(ip = %ip, username = %username, key = %public_key.display(), "Installed public key");
                Ok(KeyInstall::Installed)
            }
            Ok(Ok(output)) => Err(classify_ssh_failure(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            )),
        }
    }

    fn command(
        &self,
        ip: IpAddr,
        strategy: &AuthStrategy,
        remote_command: &str,
        timeout: Duration,
    ) -> Command {
        let mut cmd = match strategy {
            AuthStrategy::PublicKey { identity_files, .. } => {
                let mut cmd = Command::new("ssh");
                cmd.args(common_options(timeout))
                    .args(["-o", "BatchMode=yes"])
                    .args(["-o", "PreferredAuthentications=publickey"]);
                for key in identity_files {
                    cmd.arg("-i").arg(key);
                }
                cmd
            }
            AuthStrategy::Password { password, .. } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e")
                    .arg("ssh")
                    .args(common_options(timeout))
                    .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
                    .args(["-o", "PubkeyAuthentication=no"])
                    .args(["-o", "NumberOfPasswordPrompts=1"])
                    .env("SSHPASS", password);
                cmd
            }
        };

        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", strategy.username(), ip))
            .arg(remote_command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

fn common_options(timeout: Duration) -> Vec<String> {
    let connect_secs = timeout.as_secs().max(1);
    [
        "StrictHostKeyChecking=no".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "LogLevel=ERROR".to_string(),
        format!("ConnectTimeout={}", connect_secs),
    ]
    .into_iter()
    .flat_map(|option| ["-o".to_string(), option])
    .collect()
}

fn spawn_error(cmd: &Command, error: std::io::Error) -> ProbeError {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    ProbeError::ProtocolMismatch(format!("failed to run {}: {}", program, error))
}

/// Map a failed `ssh`/`sshpass` run to a probe error
pub fn classify_ssh_failure(exit_code: Option<i32>, stderr: &str) -> ProbeError {
    let lower = stderr.to_lowercase();
    let first_line = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string();

    if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || exit_code == Some(SSHPASS_BAD_PASSWORD)
    {
        ProbeError::AuthFailed(first_line)
    } else if lower.contains("connection refused")
        || lower.contains("no route to host")
        || lower.contains("network is unreachable")
        || lower.contains("could not resolve hostname")
    {
        ProbeError::Unreachable(first_line)
    } else if lower.contains("timed out") {
        ProbeError::Timeout
    } else if first_line.is_empty() {
        ProbeError::ProtocolMismatch(match exit_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        })
    } else {
        ProbeError::ProtocolMismatch(first_line)
    }
}

/// Parse the identification script output.
///
/// Returns `None` when neither a hostname nor a hardware id was printed.
pub fn parse_identity_output(stdout: &str, username: &str) -> Option<RemoteIdentity> {
    let mut identity = RemoteIdentity {
        username: username.to_string(),
        ..Default::default()
    };
    let mut serial = None;
    let mut machine_id = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "hostname" => identity.hostname = Some(value.to_string()),
            "serial" => serial = Some(value.to_string()),
            "machine_id" => machine_id = Some(value.to_string()),
            "os" => identity.os_release = Some(value.to_string()),
            _ => {}
        }
    }

    identity.unique_id = serial.or(machine_id);

    if identity.hostname.is_none() && identity.unique_id.is_none() {
        return None;
    }
    Some(identity)
}
