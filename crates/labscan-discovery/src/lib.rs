//! labscan discovery - finding and identifying lab devices
//!
//! This crate ties the probes to the identity cache:
//! - Subnet sweep (neighbour table plus fping/ping) of the target range
//! - Classification of probe outcomes into identity patches
//! - A scheduler that re-probes only stale devices, in parallel, under a
//!   cycle budget

pub mod classifier;
pub mod scheduler;
pub mod sweep;

pub use classifier::{classify, ProbeSet};
pub use scheduler::{
    DeviceSummary, DiscoveryError, DiscoveryMode, DiscoveryReport, DiscoveryRequest,
    DiscoveryScheduler, IdentityMismatch, IpConflict, IpVerification, NetworkProber, Prober,
    SchedulerConfig,
};
pub use sweep::{SweepError, TargetRange};
