//! Polling filters (`eth_newFilter`, `eth_newBlockFilter`,
//! `eth_newPendingTransactionFilter`, `eth_getFilterChanges`).
//!
//! Each filter is an ordinary subscription whose receiver is drained by a
//! background task into a buffer. Polling swaps the buffer out. Filters not
//! polled within the configured timeout are removed by a periodic sweep.

use super::event_system::EventSystem;
use crate::domain::{
    FilterCriteria, Notification, SubscriptionId, SubscriptionKind, SubscriptionReceiver,
};
use crate::error::{FilterError, FilterResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use shared_types::{Hash, Log};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Identifier of a polling filter
pub type FilterId = SubscriptionId;

/// Entries accumulated since the previous poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FilterChanges {
    Logs(Vec<Log>),
    /// Block hashes for block filters, transaction hashes otherwise
    Hashes(Vec<Hash>),
}

impl FilterChanges {
    fn empty(kind: SubscriptionKind) -> Self {
        match kind {
            SubscriptionKind::Logs => FilterChanges::Logs(Vec::new()),
            SubscriptionKind::NewHeads | SubscriptionKind::PendingTransactions => {
                FilterChanges::Hashes(Vec::new())
            }
        }
    }

    fn append(&mut self, notification: Notification) {
        match (self, notification) {
            (FilterChanges::Logs(logs), Notification::Logs(new)) => logs.extend(new),
            (FilterChanges::Hashes(hashes), Notification::Header(header)) => {
                hashes.push(header.hash)
            }
            (FilterChanges::Hashes(hashes), Notification::Hashes(new)) => hashes.extend(new),
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FilterChanges::Logs(logs) => logs.len(),
            FilterChanges::Hashes(hashes) => hashes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FilterEntry {
    kind: SubscriptionKind,
    criteria: Option<FilterCriteria>,
    created: Instant,
    last_poll: Instant,
    changes: Arc<Mutex<FilterChanges>>,
    drain: JoinHandle<()>,
}

impl FilterEntry {
    fn take_changes(&self) -> FilterChanges {
        std::mem::replace(&mut *self.changes.lock(), FilterChanges::empty(self.kind))
    }
}

struct Inner {
    system: Arc<EventSystem>,
    filters: DashMap<FilterId, FilterEntry>,
    timeout: Duration,
    max_filters: usize,
    /// Slots held by installed filters and installs in flight
    slots: AtomicUsize,
}

impl Inner {
    fn reserve_slot(&self) -> FilterResult<()> {
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < self.max_filters).then_some(held + 1)
            })
            .map(|_| ())
            .map_err(|_| FilterError::TooManyFilters {
                max: self.max_filters,
            })
    }

    fn release_slot(&self) {
        self.slots.fetch_sub(1, Ordering::AcqRel);
    }

    fn remove(&self, id: &FilterId) -> bool {
        match self.filters.remove(id) {
            Some((_, entry)) => {
                self.release_slot();
                entry.drain.abort();
                self.system.unsubscribe(id);
                true
            }
            None => false,
        }
    }

    fn sweep(&self) -> usize {
        let timeout = self.timeout;
        let expired: Vec<FilterId> = self
            .filters
            .iter()
            .filter(|entry| entry.last_poll.elapsed() >= timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            // A poll may have landed since the scan
            if let Some((_, entry)) = self
                .filters
                .remove_if(&id, |_, entry| entry.last_poll.elapsed() >= timeout)
            {
                self.release_slot();
                entry.drain.abort();
                self.system.unsubscribe(&id);
                debug!(id = %id, kind = %entry.kind, "Polling filter expired");
                removed += 1;
            }
        }

        if removed > 0 {
            self.system.metrics().record_filters_expired(removed as u64);
            info!(removed, remaining = self.filters.len(), "Expired polling filters swept");
        }
        removed
    }
}

/// Registry of polling filters layered on an [`EventSystem`]
pub struct FilterManager {
    inner: Arc<Inner>,
    sweeper: JoinHandle<()>,
}

impl FilterManager {
    /// Create the registry and start its expiry sweep.
    pub fn new(system: Arc<EventSystem>) -> Self {
        let config = system.config().clone();
        let inner = Arc::new(Inner {
            system,
            filters: DashMap::new(),
            timeout: config.filter_timeout(),
            max_filters: config.max_filters,
            slots: AtomicUsize::new(0),
        });
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&inner), config.sweep_interval()));
        Self { inner, sweeper }
    }

    /// Install a log filter.
    pub async fn new_log_filter(&self, criteria: FilterCriteria) -> FilterResult<FilterId> {
        self.install(SubscriptionKind::Logs, Some(criteria)).await
    }

    /// Install a filter collecting hashes of new blocks.
    pub async fn new_block_filter(&self) -> FilterResult<FilterId> {
        self.install(SubscriptionKind::NewHeads, None).await
    }

    /// Install a filter collecting hashes of new transactions.
    pub async fn new_pending_transaction_filter(&self) -> FilterResult<FilterId> {
        self.install(SubscriptionKind::PendingTransactions, None).await
    }

    async fn install(
        &self,
        kind: SubscriptionKind,
        criteria: Option<FilterCriteria>,
    ) -> FilterResult<FilterId> {
        self.inner.reserve_slot()?;
        let receiver = match self.subscribe(kind, criteria.clone()).await {
            Ok(receiver) => receiver,
            Err(e) => {
                self.inner.release_slot();
                return Err(e);
            }
        };

        let id = receiver.id().clone();
        let changes = Arc::new(Mutex::new(FilterChanges::empty(kind)));
        let (inserted_tx, inserted_rx) = oneshot::channel();
        let drain = tokio::spawn(drain(
            receiver,
            Arc::clone(&changes),
            Arc::downgrade(&self.inner),
            inserted_rx,
        ));
        let now = Instant::now();

        self.inner.filters.insert(
            id.clone(),
            FilterEntry {
                kind,
                criteria,
                created: now,
                last_poll: now,
                changes,
                drain,
            },
        );
        let _ = inserted_tx.send(());
        debug!(id = %id, kind = %kind, "Polling filter installed");
        Ok(id)
    }

    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        criteria: Option<FilterCriteria>,
    ) -> FilterResult<SubscriptionReceiver> {
        let mut receiver = self.inner.system.subscribe_kind(kind, criteria)?;
        receiver.installed().await?;
        Ok(receiver)
    }

    /// Entries collected since the last poll; resets the expiry deadline.
    ///
    /// # Errors
    ///
    /// `FilterNotFound` for unknown, uninstalled or expired filters.
    pub fn get_filter_changes(&self, id: &FilterId) -> FilterResult<FilterChanges> {
        let mut entry = self
            .inner
            .filters
            .get_mut(id)
            .ok_or_else(|| FilterError::FilterNotFound(id.to_string()))?;
        entry.last_poll = Instant::now();
        Ok(entry.take_changes())
    }

    /// Criteria of a log filter.
    pub fn filter_criteria(&self, id: &FilterId) -> FilterResult<Option<FilterCriteria>> {
        self.inner
            .filters
            .get(id)
            .map(|entry| entry.criteria.clone())
            .ok_or_else(|| FilterError::FilterNotFound(id.to_string()))
    }

    pub fn filter_kind(&self, id: &FilterId) -> Option<SubscriptionKind> {
        self.inner.filters.get(id).map(|entry| entry.kind)
    }

    /// Time since the filter was installed.
    pub fn filter_age(&self, id: &FilterId) -> Option<Duration> {
        self.inner.filters.get(id).map(|entry| entry.created.elapsed())
    }

    /// Remove a filter. Returns `false` if it did not exist.
    pub fn uninstall_filter(&self, id: &FilterId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            debug!(id = %id, "Polling filter uninstalled");
        }
        removed
    }

    /// Remove every filter not polled within the timeout. Returns the count.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep()
    }

    pub fn filter_count(&self) -> usize {
        self.inner.filters.len()
    }
}

impl Drop for FilterManager {
    fn drop(&mut self) {
        self.sweeper.abort();
        for entry in self.inner.filters.iter() {
            entry.drain.abort();
        }
    }
}

/// Collect notifications until the subscription ends, then drop the filter.
async fn drain(
    mut receiver: SubscriptionReceiver,
    changes: Arc<Mutex<FilterChanges>>,
    inner: Weak<Inner>,
    inserted: oneshot::Receiver<()>,
) {
    let reason = loop {
        match receiver.recv().await {
            Ok(notification) => changes.lock().append(notification),
            Err(reason) => break reason,
        }
    };

    // The entry may not be in the registry yet
    let _ = inserted.await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let id = receiver.id().clone();
    if inner
        .filters
        .remove_if(&id, |_, entry| Arc::ptr_eq(&entry.changes, &changes))
        .is_some()
    {
        inner.release_slot();
        info!(id = %id, reason = %reason, "Polling filter removed, subscription ended");
    }
}

async fn sweep_loop(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.sweep();
    }
}
