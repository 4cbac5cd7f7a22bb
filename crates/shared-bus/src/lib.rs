//! # Shared Bus - Topic-Addressed Event Bus
//!
//! The node's internal publish/subscribe transport. Producers publish
//! already-decoded event records tagged with a topic string; consumers
//! register interest in a topic and receive every record published on it.
//!
//! ## Topic Model
//!
//! ```text
//! ┌──────────────┐   publish(event)   ┌──────────────────────┐
//! │  Block/Tx    │ ─────────────────→ │   InMemoryEventBus   │
//! │  producers   │                    │                      │
//! └──────────────┘                    │  topic → channel     │
//!                                     └──────────┬───────────┘
//!                                                │ subscribe(topic)
//!                                                ▼
//!                                     ┌──────────────────────┐
//!                                     │  TopicSubscription   │
//!                                     └──────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Ordering is preserved within one topic; there is no ordering across topics.
//! - Delivery is at-most-once. A receiver that falls more than the channel
//!   capacity behind loses the oldest records.
//! - Closing a topic ends every open receiver for it.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use events::{BusEvent, EventData, TxEvent, NEW_BLOCK_HEADER_TOPIC, EVM_TX_TOPIC};
pub use publisher::{EventPublisher, InMemoryEventBus};
pub use subscriber::{BusError, RegistrationId, TopicSubscription};

/// Maximum events to buffer per topic receiver before the oldest are dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
