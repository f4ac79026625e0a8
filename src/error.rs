/// Error types for live query operations.
///
/// Every failure a live query can run into falls into one of a handful of
/// classes. Registration-time failures are returned directly; failures that
/// happen during a background refresh are delivered through the error
/// channel of each affected handle instead.
use thiserror::Error;

/// Boxed error returned by user-supplied diff callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for live query operations.
///
/// The type is `Clone` so one refresh failure can be reported to every
/// subscriber that was waiting on that refresh.
#[derive(Error, Debug, Clone)]
pub enum LiveError {
    /// Malformed registration input
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of what was wrong with the input
        reason: String,
    },

    /// The store failed to execute a query
    #[error("Store error: {0}")]
    StoreError(String),

    /// The change notifier could not be set up or torn down
    #[error("Notifier error: {0}")]
    NotifierError(String),

    /// A subscriber's diff callback returned an error
    #[error("Callback for subscription {subscription} failed: {reason}")]
    CallbackError {
        /// The subscription whose callback failed
        subscription: u64,
        /// The error message produced by the callback
        reason: String,
    },

    /// The handle or query has already been stopped
    #[error("Not found: {0}")]
    NotFound(String),

    /// Parameters or rows could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LiveError {
    /// Shorthand for an [`LiveError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for live query operations.
pub type LiveResult<T> = Result<T, LiveError>;
