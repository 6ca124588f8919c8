//! Distributed leader election and health-driven failover.
//!
//! One replica per logical service holds a session-bound mutual-exclusion key
//! in the coordination backend. The election loop drives an explicit
//! Follower/Leader state machine; transitions are delivered to observers over
//! a watch channel, never as direct calls.

mod coordinator;
#[allow(clippy::module_inception)]
mod election;
mod failover;
mod memory;

pub use coordinator::{ConsulCoordinator, CoordinationError, Coordinator, KeyObservation};
pub use election::{create_election, ElectionConfig, ElectionHandle, LeaderElection};
pub use failover::FailoverController;
pub use memory::MemoryCoordinator;
