//! Connection quality monitoring.
//!
//! A [`ConnectionMonitor`] combines the host's own online/offline signal with
//! periodic round-trip probes and publishes a [`NetworkStatus`] whenever the
//! result changes.

pub mod probe;
pub mod monitor;

pub use herald_types::NetworkStatus;
pub use monitor::{ConnectionMonitor, MonitorConfig};
pub use probe::{HttpProber, ProbeError, Prober};
