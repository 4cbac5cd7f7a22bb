//! Client-facing handle of the filter system.
//!
//! `EventSystem` spawns the control loop and talks to it only through
//! channels. Installs and uninstalls may be issued from any task.

use super::event_loop::{EventLoop, LoopHandles};
use crate::domain::{
    FilterCriteria, FilterSystemConfig, Subscription, SubscriptionId, SubscriptionKind,
    SubscriptionReceiver, Unsubscriber,
};
use crate::error::{FilterError, FilterResult, SubscriptionError};
use crate::metrics::FilterSystemMetrics;
use crate::ports::UpstreamBus;
use parking_lot::RwLock;
use shared_bus::RegistrationId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Diagnostic view of one registered upstream topic
#[derive(Debug, Clone)]
pub struct TopicRegistration {
    pub topic: String,
    /// Registration returned by the bus; shared by every subscriber
    pub registration: RegistrationId,
    /// Installed subscriptions referencing the topic
    pub subscribers: usize,
    pub registered_at: Instant,
}

/// Coordinator between the upstream bus and all active subscriptions.
///
/// Dropping the handle shuts the control loop down.
pub struct EventSystem {
    install_tx: mpsc::UnboundedSender<Subscription>,
    uninstall_tx: mpsc::UnboundedSender<SubscriptionId>,
    config: FilterSystemConfig,
    topics: Arc<RwLock<HashMap<String, TopicRegistration>>>,
    metrics: Arc<FilterSystemMetrics>,
    shutdown_tx: watch::Sender<bool>,
    terminated: watch::Receiver<bool>,
}

impl EventSystem {
    /// Start the control loop on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration does not validate.
    pub fn new(bus: Arc<dyn UpstreamBus>, config: FilterSystemConfig) -> FilterResult<Self> {
        Self::spawn(bus, config, None)
    }

    /// Start the control loop governed by an external shutdown signal.
    ///
    /// The loop stops when `shutdown` reads `true` or its sender is dropped,
    /// in addition to [`EventSystem::shutdown`].
    pub fn with_shutdown(
        bus: Arc<dyn UpstreamBus>,
        config: FilterSystemConfig,
        shutdown: watch::Receiver<bool>,
    ) -> FilterResult<Self> {
        Self::spawn(bus, config, Some(shutdown))
    }

    fn spawn(
        bus: Arc<dyn UpstreamBus>,
        config: FilterSystemConfig,
        external_shutdown: Option<watch::Receiver<bool>>,
    ) -> FilterResult<Self> {
        config.validate()?;

        let (install_tx, install_rx) = mpsc::unbounded_channel();
        let (uninstall_tx, uninstall_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (terminated_tx, terminated_rx) = watch::channel(false);
        let topics = Arc::new(RwLock::new(HashMap::new()));
        let metrics = Arc::new(FilterSystemMetrics::new());

        let event_loop = EventLoop::new(
            bus,
            config.light_mode,
            LoopHandles {
                install_rx,
                uninstall_rx,
                shutdown: shutdown_rx,
                external_shutdown,
                topics_view: Arc::clone(&topics),
                metrics: Arc::clone(&metrics),
                terminated: terminated_tx,
            },
        );
        tokio::spawn(event_loop.run());

        Ok(Self {
            install_tx,
            uninstall_tx,
            config,
            topics,
            metrics,
            shutdown_tx,
            terminated: terminated_rx,
        })
    }

    /// Hand a subscription to the control loop.
    ///
    /// Returns once the subscription is queued; wait on
    /// [`SubscriptionReceiver::installed`] before relying on delivery.
    ///
    /// # Errors
    ///
    /// - `LightModeUnsupported` if light mode forbids the kind
    /// - `SystemStopped` if the control loop has exited
    pub fn subscribe(&self, sub: Subscription) -> FilterResult<()> {
        let kind = sub.kind();
        if self.config.light_mode && kind.requires_full_node() {
            self.metrics.record_rejected();
            let err = FilterError::LightModeUnsupported { kind };
            sub.close(SubscriptionError::Rejected(err.to_string()));
            return Err(err);
        }
        if !self.is_running() {
            sub.close(SubscriptionError::Shutdown);
            return Err(FilterError::SystemStopped);
        }

        debug!(id = %sub.id(), kind = %kind, "Subscription queued for install");
        self.install_tx.send(sub).map_err(|rejected| {
            rejected.0.close(SubscriptionError::Shutdown);
            FilterError::SystemStopped
        })
    }

    /// Queue removal of `id`. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: &SubscriptionId) {
        let _ = self.uninstall_tx.send(id.clone());
    }

    /// Handle that enqueues uninstalls without borrowing the system.
    pub fn unsubscriber(&self) -> Unsubscriber {
        Unsubscriber::new(self.uninstall_tx.clone())
    }

    /// Build a subscription checked against this system's limits.
    ///
    /// The receiver unsubscribes when dropped.
    pub fn new_subscription(
        &self,
        kind: SubscriptionKind,
        criteria: Option<FilterCriteria>,
    ) -> FilterResult<(Subscription, SubscriptionReceiver)> {
        if let Some(criteria) = criteria.as_ref().filter(|_| kind.accepts_criteria()) {
            criteria.validate(
                self.config.max_topics_per_filter,
                self.config.max_addresses_per_filter,
            )?;
        }

        let (sub, mut receiver) = Subscription::new(kind, criteria, self.config.delivery_buffer)?;
        receiver.attach(self.unsubscriber());
        Ok((sub, receiver))
    }

    /// Create and install a subscription of `kind`.
    pub fn subscribe_kind(
        &self,
        kind: SubscriptionKind,
        criteria: Option<FilterCriteria>,
    ) -> FilterResult<SubscriptionReceiver> {
        let (sub, receiver) = self.new_subscription(kind, criteria)?;
        self.subscribe(sub)?;
        Ok(receiver)
    }

    /// Subscribe to logs matching `criteria`.
    pub fn subscribe_logs(&self, criteria: FilterCriteria) -> FilterResult<SubscriptionReceiver> {
        self.subscribe_kind(SubscriptionKind::Logs, Some(criteria))
    }

    /// Subscribe to newly committed headers.
    pub fn subscribe_new_heads(&self) -> FilterResult<SubscriptionReceiver> {
        self.subscribe_kind(SubscriptionKind::NewHeads, None)
    }

    /// Subscribe to hashes of newly executed transactions.
    pub fn subscribe_pending_transactions(&self) -> FilterResult<SubscriptionReceiver> {
        self.subscribe_kind(SubscriptionKind::PendingTransactions, None)
    }

    /// Topics currently registered upstream, sorted.
    pub fn registered_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Registration details of one topic, if registered.
    pub fn topic_registration(&self, topic: &str) -> Option<TopicRegistration> {
        self.topics.read().get(topic).cloned()
    }

    /// Installed subscriptions, as last published by the control loop.
    pub fn subscription_count(&self) -> usize {
        self.topics.read().values().map(|t| t.subscribers).sum()
    }

    pub fn metrics(&self) -> Arc<FilterSystemMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &FilterSystemConfig {
        &self.config
    }

    pub fn is_light_mode(&self) -> bool {
        self.config.light_mode
    }

    pub fn is_running(&self) -> bool {
        !*self.terminated.borrow()
    }

    /// Stop the control loop. Every remaining subscription receives
    /// [`SubscriptionError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Event system shutdown requested");
        }
    }

    /// Wait until the control loop has terminated.
    pub async fn stopped(&self) {
        let mut terminated = self.terminated.clone();
        let _ = terminated.wait_for(|done| *done).await;
    }
}

impl Drop for EventSystem {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl std::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSystem")
            .field("config", &self.config)
            .field("topics", &self.registered_topics())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
