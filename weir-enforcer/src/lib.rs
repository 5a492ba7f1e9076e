//! Bandwidth enforcement for the weir control plane.
//!
//! Each [`EnforcementLoop`] observes one metric hub's raw channel, runs an
//! [`AllocationStrategy`] over the tick's batch and publishes change
//! records to the per-node bandwidth queues. Records are change-only: a
//! flow is republished when its integer-rounded share moves or when the
//! strategy's reset window has elapsed since the previous tick.

mod enforcer;
mod error;
mod strategy;

pub use enforcer::{EnforcementLoop, EnforcerConfig};
pub use error::AllocationError;
pub use strategy::{
    AllocationStrategy, Assignment, MinSloWithSpareShare, ProportionalPerTenant,
    ProportionalReplication, Share, SloSnapshot,
};
