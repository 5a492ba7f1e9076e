use thiserror::Error;

/// Errors surfaced to whoever submitted a rule. A rule that fails to parse
/// is never activated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DslError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown metric '{0}': not present in the metric catalog")]
    UnknownMetric(String),

    #[error("unknown filter '{0}': not present in the filter catalog")]
    UnknownFilter(String),

    #[error("filter '{filter}' does not accept parameter '{param}'")]
    UnknownActionParam { filter: String, param: String },

    #[error("unknown tenant group '{0}'")]
    UnknownGroup(String),
}

impl DslError {
    pub(crate) fn syntax(message: impl Into<String>) -> Self {
        DslError::Syntax(message.into())
    }
}
