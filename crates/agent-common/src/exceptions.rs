// Typed errors that callers match on to decide retry behavior.

/// An error indicating that the operation must NOT be retried.
///
/// The control plane returns these for plan-not-found and security failures;
/// retrying would only repeat the rejection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct NonRetryableError {
    pub message: String,
}

impl NonRetryableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
