//! Pub/sub error types.

use thiserror::Error;

/// Errors returned by the broker and subscriber handles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PubSubError {
    /// The bucket owning this topic has no room for another delivery.
    #[error("delivery queue full for topic {topic}")]
    BucketFull {
        /// Topic the payload was published to.
        topic: String,
    },
    /// The delivery workers have stopped.
    #[error("pub/sub broker is closed")]
    Closed,
    /// The subscriber was closed and accepts no new subscriptions.
    #[error("subscriber {id} is closed")]
    SubscriberClosed {
        /// Id of the closed subscriber.
        id: u64,
    },
}

/// Result type for pub/sub operations.
pub type Result<T> = std::result::Result<T, PubSubError>;
