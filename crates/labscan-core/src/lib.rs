//! labscan core - identity types, identity cache and device relationships
//!
//! This crate provides the foundational types for labscan:
//! - Device identity records and the patches probes produce
//! - A durable identity cache with serialized read-merge-write
//! - The credential store and remote shell authentication chain
//! - Power switch to device control relationships

pub mod cache;
pub mod credentials;
pub mod device;
pub mod topology;

pub use cache::{CacheError, IdentityCache, IdentityStore, MergeOutcome};
pub use credentials::{
    AuthStrategy, CredentialKind, CredentialResolver, CredentialSource, CredentialStore,
    DefaultCredentials, ExplicitCredentials, StoredCredential,
};
pub use device::{
    CandidateOrigin, ConfiguredDevice, DeviceCandidate, DeviceIdentity, DeviceKey, DeviceKind,
    DeviceType, IdentityPatch, PowerState, SshStatus,
};
pub use topology::{LinkSource, PowerLink, PowerTopology};
