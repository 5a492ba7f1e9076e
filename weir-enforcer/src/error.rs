use thiserror::Error;

/// Per-account conditions a strategy skips over instead of raising. They
/// are logged by the strategy and never abort the tick.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("account {account} has no active flows this tick")]
    ZeroFlows { account: String },

    #[error("account {account} has no SLO entry")]
    MissingSlo { account: String },
}
