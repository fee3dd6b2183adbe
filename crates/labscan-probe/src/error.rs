//! Probe failure taxonomy

use labscan_core::SshStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Unreachable: {0}")]
    Unreachable(String),
    #[error("Timed out")]
    Timeout,
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl ProbeError {
    /// Remote shell status this failure is reported as
    pub fn ssh_status(&self) -> SshStatus {
        match self {
            ProbeError::Unreachable(_) => SshStatus::Refused,
            ProbeError::Timeout => SshStatus::Timeout,
            ProbeError::AuthFailed(_) => SshStatus::AuthFailed,
            ProbeError::ProtocolMismatch(_) => SshStatus::Unknown,
        }
    }

    /// Keep whichever of two failures says more about the device
    pub fn most_informative(self, other: ProbeError) -> ProbeError {
        if other.ssh_status().informativeness() > self.ssh_status().informativeness() {
            other
        } else {
            self
        }
    }
}
