//! # Topic Subscriber
//!
//! Defines the subscription side of the event bus.

use crate::events::BusEvent;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Errors from bus registration operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The topic string is empty or otherwise unusable.
    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    /// The bus refuses new registrations.
    #[error("Event bus closed")]
    Closed,
}

/// Identifier of one upstream topic registration.
///
/// Two handles with the same id share the same underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// A receive handle for one topic.
pub struct TopicSubscription {
    /// Topic this handle is bound to.
    topic: String,

    /// Registration of the topic's channel.
    registration: RegistrationId,

    /// The broadcast receiver.
    receiver: broadcast::Receiver<BusEvent>,
}

impl TopicSubscription {
    /// Create a new topic subscription.
    pub(crate) fn new(
        topic: String,
        registration: RegistrationId,
        receiver: broadcast::Receiver<BusEvent>,
    ) -> Self {
        Self {
            topic,
            registration,
            receiver,
        }
    }

    /// Topic this handle is bound to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Registration of the topic's channel.
    #[must_use]
    pub fn registration(&self) -> RegistrationId {
        self.registration
    }

    /// Receive the next event on this topic.
    ///
    /// # Returns
    ///
    /// - `Some(event)` - The next event
    /// - `None` - The topic was closed
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    debug!(topic = %self.topic, lagged = count, "Topic receiver lagged, some events dropped");
                    continue;
                }
            }
        }
    }

    /// Unwrap into the raw broadcast receiver.
    ///
    /// Used by consumers that multiplex many topics as streams.
    #[must_use]
    pub fn into_receiver(self) -> broadcast::Receiver<BusEvent> {
        self.receiver
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::events::{BusEvent, EventData, NEW_BLOCK_HEADER_TOPIC};
    use crate::publisher::{EventPublisher, InMemoryEventBus};
    use shared_types::Header;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_topic_recv() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(NEW_BLOCK_HEADER_TOPIC).unwrap();

        bus.publish(BusEvent::new_block_header(Header::default())).await;

        let received = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timeout")
            .expect("event");
        assert!(matches!(received.data, EventData::NewBlockHeader(_)));
    }

    #[tokio::test]
    async fn test_recv_none_after_topic_closed() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe("a").unwrap();

        assert!(bus.unsubscribe("a"));

        let received = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timeout");
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_recv_skips_lagged_events() {
        let bus = InMemoryEventBus::with_capacity(2);
        let mut sub = bus.subscribe("a").unwrap();

        for number in 0..5 {
            let header = Header {
                number,
                ..Default::default()
            };
            bus.publish(BusEvent::new("a", EventData::NewBlockHeader(header)))
                .await;
        }

        let received = sub.recv().await.expect("event");
        match received.data {
            EventData::NewBlockHeader(header) => assert_eq!(header.number, 3),
            other => panic!("unexpected payload {}", other.name()),
        }
    }
}
