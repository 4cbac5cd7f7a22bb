//! Counters for the filter system
//!
//! Updated from the control loop and the polling filter layer; read through
//! [`FilterSystemMetrics::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for subscription and fan-out activity
#[derive(Debug, Default)]
pub struct FilterSystemMetrics {
    /// Subscriptions installed
    pub installs: AtomicU64,
    /// Subscriptions removed for any reason
    pub uninstalls: AtomicU64,
    /// Installs rejected synchronously or by the control loop
    pub rejected: AtomicU64,
    /// Upstream events handled by the control loop
    pub events_received: AtomicU64,
    /// Notifications handed to delivery channels
    pub notifications_delivered: AtomicU64,
    /// Events skipped because they could not be matched
    pub transient_errors: AtomicU64,
    /// Upstream topic registrations (0 → 1 transitions)
    pub topics_registered: AtomicU64,
    /// Upstream topic releases (1 → 0 transitions and closures)
    pub topics_released: AtomicU64,
    /// Polling filters removed by the expiry sweep
    pub filters_expired: AtomicU64,
}

impl FilterSystemMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_install(&self) {
        self.installs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uninstall(&self) {
        self.uninstalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, count: u64) {
        self.notifications_delivered
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_topic_registered(&self) {
        self.topics_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_topic_released(&self) {
        self.topics_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filters_expired(&self, count: u64) {
        self.filters_expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            installs: self.installs.load(Ordering::Relaxed),
            uninstalls: self.uninstalls.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            topics_registered: self.topics_registered.load(Ordering::Relaxed),
            topics_released: self.topics_released.load(Ordering::Relaxed),
            filters_expired: self.filters_expired.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`FilterSystemMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub installs: u64,
    pub uninstalls: u64,
    pub rejected: u64,
    pub events_received: u64,
    pub notifications_delivered: u64,
    pub transient_errors: u64,
    pub topics_registered: u64,
    pub topics_released: u64,
    pub filters_expired: u64,
}

impl MetricsSnapshot {
    /// Subscriptions currently installed.
    pub fn active_subscriptions(&self) -> u64 {
        self.installs.saturating_sub(self.uninstalls)
    }

    /// Upstream topics currently registered.
    pub fn active_topics(&self) -> u64 {
        self.topics_registered.saturating_sub(self.topics_released)
    }
}
