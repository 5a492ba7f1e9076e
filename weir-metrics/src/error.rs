use thiserror::Error;

/// Errors raised by a metric hub while handling attachments or payloads.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("malformed metric payload: {0}")]
    Decode(String),

    #[error("metric hub has stopped")]
    Stopped,
}

/// A subscriber could not take delivery of a tick. The hub logs and skips
/// the subscriber; remaining deliveries for the tick are unaffected.
#[derive(Debug, Error)]
#[error("delivery to subscriber '{subscriber}' failed: {reason}")]
pub struct DeliveryError {
    pub subscriber: String,
    pub reason: String,
}

impl DeliveryError {
    pub fn new(subscriber: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            reason: reason.into(),
        }
    }
}
