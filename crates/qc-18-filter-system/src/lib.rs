//! # QC-18 Filter System - Event Subscriptions and Fan-Out
//!
//! Bridges the node's topic-addressed event bus to client subscriptions
//! (`eth_subscribe` and the polling `eth_newFilter` family).
//!
//! ## Architecture
//!
//! ```text
//!  clients (any task)                 control loop (one task)
//! ┌────────────────────┐  install   ┌──────────────────────────────┐
//! │ EventSystem handle │ ─────────→ │ index: kind → id → Sub       │
//! │                    │ uninstall  │ topic_chans: topic → reg     │
//! │ SubscriptionRecv'r │ ─────────→ │ StreamMap<topic, upstream>   │
//! └─────────▲──────────┘            └──────────────┬───────────────┘
//!           │ delivery / installed / err           │ subscribe / unsubscribe
//!           └──────────────────────────────────────┤ (0→1 and 1→0 only)
//!                                                  ▼
//!                                       ┌──────────────────────┐
//!                                       │   InMemoryEventBus   │
//!                                       └──────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - One upstream registration per topic, however many subscriptions share it.
//! - A subscription whose `installed` signal fired receives every later event
//!   on its topic, in bus order.
//! - A slow subscriber loses its oldest notifications; it never stalls others.
//! - Failures of one event are logged and skipped. Closure of one topic only
//!   affects that topic's subscriptions.
//!
//! ## Topic Derivation
//!
//! | Kind                     | Upstream topic                               |
//! |--------------------------|----------------------------------------------|
//! | `newHeads`               | `tm.event='NewBlockHeader'`                  |
//! | `logs`                   | `tm.event='Tx' AND message.module='evm'`     |
//! | `newPendingTransactions` | `tm.event='Tx' AND message.module='evm'`     |
//!
//! Log filters share one topic and are told apart by their criteria.
//!
//! ## Usage
//!
//! ```ignore
//! use qc_18_filter_system::{EventSystem, FilterCriteria, FilterSystemConfig};
//!
//! let system = EventSystem::new(bus, FilterSystemConfig::default())?;
//! let mut logs = system.subscribe_logs(FilterCriteria::new().with_address(token))?;
//! logs.installed().await?;
//! while let Ok(notification) = logs.recv().await {
//!     // forward to the client
//! }
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod service;

// Re-export main types
pub use domain::{
    BlockSpec, BlockTag, FilterCriteria, FilterSystemConfig, Notification, Subscription,
    SubscriptionId, SubscriptionKind, SubscriptionReceiver, Unsubscriber,
};
pub use error::{EventError, FilterError, FilterResult, SubscriptionError};
pub use metrics::{FilterSystemMetrics, MetricsSnapshot};
pub use ports::UpstreamBus;
pub use service::{EventSystem, FilterChanges, FilterId, FilterManager, TopicRegistration};
