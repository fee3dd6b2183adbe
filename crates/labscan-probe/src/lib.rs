//! labscan probes - stateless network checks for lab devices
//!
//! Each probe takes an address and a hard timeout and returns either the
//! metadata it learned or a typed [`ProbeError`]:
//! - remote shell identification through the system `ssh` client
//! - smart power switch detection over the Tasmota web API
//! - SCPI `*IDN?` handshake for programmable instruments

pub mod error;
pub mod scpi;
pub mod ssh;
pub mod switch;

pub use error::ProbeError;
pub use scpi::{parse_idn, InstrumentIdentity, InstrumentProbe, INSTRUMENT_PORTS};
pub use ssh::{KeyInstall, RemoteCommandProbe, RemoteIdentity, SSH_PORT};
pub use switch::{SwitchProbe, SwitchStatus, HTTP_PORT};
