//! Rule evaluation engine for the weir control plane.
//!
//! Every activated policy runs as one rule actor: it subscribes to the
//! metrics its condition references, re-evaluates the condition tree on
//! each update, and on a truth-value transition deploys or undeploys a
//! processing filter through the cluster control API. One-shot rules fire
//! once and stop; transient rules keep the filter deployed exactly while
//! the condition holds.

mod dispatch;
mod error;
mod manager;
mod rule;
mod service;
mod state;

pub use dispatch::{ActionDispatcher, ControlApiClient};
pub use error::{DispatchError, RuleError};
pub use manager::{hub_registry_name, ActivatedPolicy, RuleManager, RuleSummary};
pub use rule::{RuleActor, RuleHandle, RuleStatus};
pub use service::{ActivationRequest, ActivationResponse, PolicyApiBuilder, PolicyServiceConfig};
pub use state::{Edge, RuleState};
