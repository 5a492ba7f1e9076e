use reqwest::StatusCode;
use thiserror::Error;

use weir_dsl::DslError;

/// Control-API call failures. A failed dispatch never advances the rule's
/// fired state, so the next qualifying edge retries the action.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid control API url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("control API request failed: {0}")]
    Http(String),

    #[error("control API returned unexpected status {status}")]
    UnexpectedStatus { status: StatusCode },
}

/// Errors surfaced by the rule engine and the policy API.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error(transparent)]
    Parse(#[from] DslError),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("rule {0} not found")]
    NotFound(String),

    #[error("rule has stopped")]
    Stopped,
}
