//! # Event Publisher
//!
//! Defines the publishing side of the event bus and the in-memory bus
//! that routes records by topic.

use crate::events::BusEvent;
use crate::subscriber::{BusError, RegistrationId, TopicSubscription};
use crate::DEFAULT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Trait for publishing events to the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event to the bus.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to publish, routed by its `topic`
    ///
    /// # Returns
    ///
    /// The number of active receivers that got the event.
    async fn publish(&self, event: BusEvent) -> usize;

    /// Get the total number of events published.
    fn events_published(&self) -> u64;
}

/// A registered topic channel.
struct TopicChannel {
    registration: RegistrationId,
    sender: broadcast::Sender<BusEvent>,
}

/// In-memory implementation of the event bus.
///
/// Each topic owns one `tokio::sync::broadcast` channel, created on the first
/// `subscribe` for that topic and dropped by `unsubscribe`. Dropping the
/// channel ends every receiver that is still attached to it.
pub struct InMemoryEventBus {
    /// Channels by topic.
    topics: RwLock<HashMap<String, TopicChannel>>,

    /// Source of registration ids.
    next_registration: AtomicU64,

    /// Total events published.
    events_published: AtomicU64,

    /// Set once the bus refuses new registrations.
    closed: AtomicBool,

    /// Channel capacity per topic.
    capacity: usize,
}

impl InMemoryEventBus {
    /// Create a new in-memory event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new in-memory event bus with specified per-topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a topic.
    ///
    /// Creates the topic channel if it does not exist yet. Every call returns
    /// a fresh receiver; receivers on the same topic share one registration.
    pub fn subscribe(&self, topic: &str) -> Result<TopicSubscription, BusError> {
        if topic.trim().is_empty() {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let mut topics = self.topics.write().map_err(|_| BusError::Closed)?;
        let channel = topics.entry(topic.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            let registration =
                RegistrationId(self.next_registration.fetch_add(1, Ordering::Relaxed));
            info!(topic = %topic, %registration, "Topic channel created");
            TopicChannel {
                registration,
                sender,
            }
        });

        Ok(TopicSubscription::new(
            topic.to_string(),
            channel.registration,
            channel.sender.subscribe(),
        ))
    }

    /// Drop a topic channel, ending all of its receivers.
    ///
    /// Returns `false` if the topic was not registered.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let Ok(mut topics) = self.topics.write() else {
            return false;
        };
        let removed = topics.remove(topic).is_some();
        if removed {
            info!(topic = %topic, "Topic channel removed");
        }
        removed
    }

    /// Close the bus: drop every topic channel and refuse new registrations.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut topics) = self.topics.write() {
            topics.clear();
        }
        info!("Event bus closed");
    }

    /// Registration of a topic, if it has a channel.
    #[must_use]
    pub fn registration(&self, topic: &str) -> Option<RegistrationId> {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(topic).map(|c| c.registration))
    }

    /// Number of topics with a live channel.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Number of receivers attached to a topic.
    #[must_use]
    pub fn receiver_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(topic).map(|c| c.sender.receiver_count()))
            .unwrap_or(0)
    }

    /// Get the per-topic channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: BusEvent) -> usize {
        // Always increment counter (event was attempted)
        self.events_published.fetch_add(1, Ordering::Relaxed);

        let sender = match self.topics.read() {
            Ok(topics) => topics.get(&event.topic).map(|c| c.sender.clone()),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            trace!(topic = %event.topic, "Event dropped (topic not registered)");
            return 0;
        };

        let topic = event.topic.clone();
        let payload = event.data.name();
        match sender.send(event) {
            Ok(receivers) => {
                debug!(topic = %topic, payload, receivers, "Event published");
                receivers
            }
            Err(_) => {
                debug!(topic = %topic, payload, "Event dropped (no receivers)");
                0
            }
        }
    }

    fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }
}
