//! Dependency health probing and aggregation.
//!
//! Each external dependency gets an independent polling loop that runs a
//! probe and reports the boolean result into the [`HealthAggregator`]. The
//! aggregate signal (AND of all components) feeds the readiness endpoint and
//! the failover controller.

mod aggregator;
mod probes;

pub use aggregator::{ComponentHealth, HealthAggregator};
pub use probes::{
    spawn_probe_loops, BlobStoreProbe, BrokerProbe, DatabaseProbe, DependencyProbe, ProbeSchedule,
};
