//! Core shared library for the weir control plane.
//!
//! This crate exposes reusable primitives that the control-plane
//! components depend on: common errors, configuration loading, the
//! message-bus abstraction, the configuration-store catalog and the
//! actor-runtime registry.

pub mod bus;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod logging;
pub mod runtime;

pub use bus::{Binding, Delivery, MessageBus};
pub use catalog::{Catalog, CatalogDocument, FilterSpec, MetricSource, SloEntry};
pub use errors::{CoreError, Result as CoreResult};
pub use runtime::{Mailbox, Registry, Stoppable};
