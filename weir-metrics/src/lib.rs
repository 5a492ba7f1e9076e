//! Metric ingestion and fan-out for the weir control plane.
//!
//! One [`MetricHub`] runs per monitored signal. It consumes raw payloads
//! from a transport binding, accumulates them over a fixed wall-clock
//! window, and on every tick pushes per-tenant sums to aggregated
//! subscribers and the full unaggregated batch to the single raw observer.

mod batch;
mod error;
mod hub;

pub use batch::{Flow, MetricPayload, RawBatch, Window};
pub use error::{DeliveryError, HubError};
pub use hub::{
    HubConfig, HubHandle, HubInfo, MetricHub, MetricSubscriber, RawBatchObserver,
    SubscriberChannel,
};
