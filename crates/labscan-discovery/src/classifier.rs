//! Probe outcomes to identity patch

use chrono::{DateTime, Utc};
use labscan_core::{DeviceCandidate, DeviceKind, IdentityPatch, SshStatus};
use labscan_probe::{InstrumentIdentity, ProbeError, RemoteIdentity, SwitchStatus};

/// Outcome of the three probes run against one candidate
#[derive(Debug, Clone)]
pub struct ProbeSet {
    pub remote: Result<RemoteIdentity, ProbeError>,
    pub switch: Result<SwitchStatus, ProbeError>,
    pub instrument: Result<InstrumentIdentity, ProbeError>,
}

impl ProbeSet {
    /// A probe set where nothing answered
    pub fn unreachable(error: ProbeError) -> Self {
        Self {
            remote: Err(error.clone()),
            switch: Err(error.clone()),
            instrument: Err(error),
        }
    }

    pub fn ssh_status(&self) -> SshStatus {
        match &self.remote {
            Ok(_) => SshStatus::Ok,
            Err(e) => e.ssh_status(),
        }
    }
}

/// Combine a probe set into a single patch.
///
/// An instrument answer wins over a switch answer, which wins over a
/// remote shell login. `ssh_status` always comes from the remote probe.
pub fn classify(
    candidate: &DeviceCandidate,
    probes: &ProbeSet,
    attempted_at: DateTime<Utc>,
) -> IdentityPatch {
    let ssh_status = probes.ssh_status();
    let remote = probes.remote.as_ref().ok();
    let remote_hostname = remote.and_then(|r| r.hostname.clone());

    let mut patch = IdentityPatch::failed(Some(candidate.ip), ssh_status, attempted_at);

    if let Ok(instrument) = &probes.instrument {
        patch.identified = true;
        patch.kind = DeviceKind::TestInstrument {
            manufacturer: Some(instrument.manufacturer.clone()),
            model: Some(instrument.model.clone()),
            port: Some(instrument.port),
        };
        patch.hostname = remote_hostname;
        patch.unique_id = instrument.serial.clone();
        patch.firmware_version = instrument.firmware.clone();
    } else if let Ok(switch) = &probes.switch {
        patch.identified = true;
        patch.kind = DeviceKind::PowerSwitch {
            power_state: switch.power_state,
            power_watts: switch.power_watts,
            load_name: switch.load_name.clone(),
        };
        patch.hostname = switch.hostname.clone().or(remote_hostname);
        patch.unique_id = switch.mac.clone();
        patch.firmware_version = switch.firmware_version.clone();
    } else if let Some(remote) = remote {
        patch.identified = true;
        patch.kind = DeviceKind::Generic;
        patch.hostname = remote.hostname.clone();
        patch.unique_id = remote.unique_id.clone();
        patch.firmware_version = remote.os_release.clone();
    }

    patch
}
