//! Event bus adapter.
//!
//! Implements [`UpstreamBus`] over the shared in-memory bus so the filter
//! system consumes the same topics block and transaction producers publish on.

use crate::ports::UpstreamBus;
use shared_bus::{BusError, InMemoryEventBus, TopicSubscription};
use tracing::debug;

impl UpstreamBus for InMemoryEventBus {
    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, BusError> {
        InMemoryEventBus::subscribe(self, topic)
    }

    fn unsubscribe(&self, topic: &str) {
        if !InMemoryEventBus::unsubscribe(self, topic) {
            debug!(topic = %topic, "Topic already released on the bus");
        }
    }
}
