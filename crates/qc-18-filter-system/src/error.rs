//! Error types for the filter system

use crate::domain::SubscriptionKind;
use thiserror::Error;

/// Errors returned synchronously to callers of the filter system
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid filter criteria: {0}")]
    InvalidCriteria(String),

    #[error("Criteria not allowed for {kind} subscriptions")]
    CriteriaNotAllowed { kind: SubscriptionKind },

    #[error("Too many topics in filter: {count} > {max}")]
    TooManyTopics { count: usize, max: usize },

    #[error("Pending logs are not supported")]
    PendingLogsUnsupported,

    #[error("Invalid from and to block combination: from > to ({from} > {to})")]
    InvalidBlockRange { from: String, to: String },

    #[error("{kind} subscriptions are not supported in light mode")]
    LightModeUnsupported { kind: SubscriptionKind },

    #[error("Unknown subscription kind: {0}")]
    UnknownKind(String),

    #[error("Filter system stopped")]
    SystemStopped,

    #[error("Filter not found: {0}")]
    FilterNotFound(String),

    #[error("Too many filters: limit is {max}")]
    TooManyFilters { max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Subscription failed: {0}")]
    Subscription(#[from] SubscriptionError),
}

/// Terminal condition delivered on a subscription's error signal
///
/// Any value means the subscription is dead and the client should stop reading.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscription rejected: {0}")]
    Rejected(String),

    #[error("Upstream topic closed: {topic}")]
    TopicClosed { topic: String },

    #[error("Upstream registration failed: {0}")]
    Upstream(String),

    #[error("Unsubscribed")]
    Unsubscribed,

    #[error("Filter system shut down")]
    Shutdown,

    #[error("Subscription closed")]
    Closed,
}

/// Errors local to one event; logged and skipped
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Unexpected {payload} payload for {kind} subscription")]
    PayloadMismatch {
        kind: SubscriptionKind,
        payload: &'static str,
    },

    #[error("Payload decode failed: {0}")]
    Decode(String),
}

/// Result alias for filter system operations
pub type FilterResult<T> = Result<T, FilterError>;
