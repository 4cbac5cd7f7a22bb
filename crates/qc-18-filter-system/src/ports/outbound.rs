//! Outbound ports for the filter system.

use shared_bus::{BusError, TopicSubscription};
use std::sync::Arc;

/// Topic-addressed upstream event source.
///
/// The event system calls `subscribe` once when a topic gains its first
/// referent and `unsubscribe` once when it loses its last. Both are called
/// from the control loop and must not block.
pub trait UpstreamBus: Send + Sync + 'static {
    /// Register interest in `topic` and return its receive handle.
    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, BusError>;

    /// Release the registration for `topic`.
    fn unsubscribe(&self, topic: &str);
}

impl<T: UpstreamBus + ?Sized> UpstreamBus for Arc<T> {
    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, BusError> {
        (**self).subscribe(topic)
    }

    fn unsubscribe(&self, topic: &str) {
        (**self).unsubscribe(topic)
    }
}
