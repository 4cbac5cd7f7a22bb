//! The control loop.
//!
//! Single owner of the subscription index and the upstream topic table.
//! Everything reaches it through the install and uninstall intakes; upstream
//! topics are multiplexed into one `StreamMap` keyed by topic.

use super::event_system::TopicRegistration;
use crate::domain::{Subscription, SubscriptionId, SubscriptionKind};
use crate::error::{FilterError, SubscriptionError};
use crate::metrics::FilterSystemMetrics;
use crate::ports::UpstreamBus;
use parking_lot::RwLock;
use shared_bus::{BusEvent, TopicSubscription};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, info, trace, warn};

/// What one upstream topic stream yields.
enum Upstream {
    Event(BusEvent),
    Lagged(u64),
    /// The bus dropped the topic channel
    Closed,
}

type UpstreamStream = Pin<Box<dyn Stream<Item = Upstream> + Send>>;

fn upstream_stream(handle: TopicSubscription) -> UpstreamStream {
    let events = BroadcastStream::new(handle.into_receiver()).map(|item| match item {
        Ok(event) => Upstream::Event(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => Upstream::Lagged(skipped),
    });
    Box::pin(events.chain(tokio_stream::once(Upstream::Closed)))
}

/// Resolves once `rx` reads `true` or its sender is gone; never for `None`.
async fn cancelled(rx: Option<&mut watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            let _ = rx.wait_for(|stop| *stop).await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub(crate) struct EventLoop {
    bus: Arc<dyn UpstreamBus>,
    light_mode: bool,
    index: HashMap<SubscriptionKind, HashMap<SubscriptionId, Subscription>>,
    topic_chans: HashMap<String, TopicRegistration>,
    upstream: StreamMap<String, UpstreamStream>,
    install_rx: mpsc::UnboundedReceiver<Subscription>,
    uninstall_rx: mpsc::UnboundedReceiver<SubscriptionId>,
    shutdown: watch::Receiver<bool>,
    external_shutdown: Option<watch::Receiver<bool>>,
    topics_view: Arc<RwLock<HashMap<String, TopicRegistration>>>,
    metrics: Arc<FilterSystemMetrics>,
    terminated: watch::Sender<bool>,
}

pub(crate) struct LoopHandles {
    pub install_rx: mpsc::UnboundedReceiver<Subscription>,
    pub uninstall_rx: mpsc::UnboundedReceiver<SubscriptionId>,
    pub shutdown: watch::Receiver<bool>,
    pub external_shutdown: Option<watch::Receiver<bool>>,
    pub topics_view: Arc<RwLock<HashMap<String, TopicRegistration>>>,
    pub metrics: Arc<FilterSystemMetrics>,
    pub terminated: watch::Sender<bool>,
}

impl EventLoop {
    pub(crate) fn new(bus: Arc<dyn UpstreamBus>, light_mode: bool, handles: LoopHandles) -> Self {
        Self {
            bus,
            light_mode,
            index: HashMap::new(),
            topic_chans: HashMap::new(),
            upstream: StreamMap::new(),
            install_rx: handles.install_rx,
            uninstall_rx: handles.uninstall_rx,
            shutdown: handles.shutdown,
            external_shutdown: handles.external_shutdown,
            topics_view: handles.topics_view,
            metrics: handles.metrics,
            terminated: handles.terminated,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(light_mode = self.light_mode, "Event system started");

        loop {
            tokio::select! {
                biased;

                _ = cancelled(Some(&mut self.shutdown)) => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = cancelled(self.external_shutdown.as_mut()) => {
                    info!("Governing context cancelled");
                    break;
                }
                install = self.install_rx.recv() => match install {
                    Some(sub) => self.install(sub),
                    // Every handle to the system is gone
                    None => break,
                },
                Some(id) = self.uninstall_rx.recv() => {
                    self.uninstall(&id, SubscriptionError::Unsubscribed);
                }
                Some((topic, message)) = self.upstream.next(), if !self.upstream.is_empty() => {
                    self.dispatch(&topic, message);
                }
            }
        }

        self.shutdown_all();
    }

    fn install(&mut self, sub: Subscription) {
        let kind = sub.kind();

        if self.light_mode && kind.requires_full_node() {
            self.reject(sub, FilterError::LightModeUnsupported { kind }.to_string());
            return;
        }
        if self.contains(sub.id()) {
            let reason = format!("duplicate subscription id {}", sub.id());
            self.reject(sub, reason);
            return;
        }

        let topic = sub.topic().to_string();
        if !self.topic_chans.contains_key(&topic) {
            match self.bus.subscribe(&topic) {
                Ok(handle) => {
                    let registration = handle.registration();
                    self.upstream.insert(topic.clone(), upstream_stream(handle));
                    self.topic_chans.insert(
                        topic.clone(),
                        TopicRegistration {
                            topic: topic.clone(),
                            registration,
                            subscribers: 0,
                            registered_at: Instant::now(),
                        },
                    );
                    self.metrics.record_topic_registered();
                    info!(topic = %topic, %registration, "Upstream topic registered");
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Upstream registration failed");
                    self.metrics.record_rejected();
                    sub.close(SubscriptionError::Upstream(e.to_string()));
                    return;
                }
            }
        }
        if let Some(entry) = self.topic_chans.get_mut(&topic) {
            entry.subscribers += 1;
        }

        let id = sub.id().clone();
        self.index.entry(kind).or_default().insert(id.clone(), sub);
        self.metrics.record_install();
        self.publish_view();

        // Signal only once the subscription is visible everywhere
        if let Some(sub) = self.index.get_mut(&kind).and_then(|bucket| bucket.get_mut(&id)) {
            sub.mark_installed();
        }
        debug!(id = %id, kind = %kind, topic = %topic, "Subscription installed");
    }

    fn reject(&self, sub: Subscription, reason: String) {
        warn!(id = %sub.id(), kind = %sub.kind(), reason = %reason, "Subscription rejected");
        self.metrics.record_rejected();
        sub.close(SubscriptionError::Rejected(reason));
    }

    fn contains(&self, id: &SubscriptionId) -> bool {
        self.index.values().any(|bucket| bucket.contains_key(id))
    }

    fn remove(&mut self, id: &SubscriptionId) -> Option<Subscription> {
        self.index
            .values_mut()
            .find_map(|bucket| bucket.remove(id))
    }

    /// Remove one subscription. Unknown ids are ignored.
    fn uninstall(&mut self, id: &SubscriptionId, reason: SubscriptionError) {
        let Some(sub) = self.remove(id) else {
            trace!(id = %id, "Uninstall of unknown subscription ignored");
            return;
        };

        self.release_topic(sub.topic());
        self.metrics.record_uninstall();
        self.publish_view();
        debug!(id = %id, kind = %sub.kind(), reason = %reason, "Subscription uninstalled");
        sub.close(reason);
    }

    /// Drop one referent of `topic`; unregisters upstream on the last.
    fn release_topic(&mut self, topic: &str) {
        let Some(entry) = self.topic_chans.get_mut(topic) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return;
        }

        self.topic_chans.remove(topic);
        self.upstream.remove(topic);
        self.bus.unsubscribe(topic);
        self.metrics.record_topic_released();
        info!(topic = %topic, "Upstream topic released");
    }

    fn dispatch(&mut self, topic: &str, message: Upstream) {
        match message {
            Upstream::Event(event) => self.fan_out(topic, &event),
            Upstream::Lagged(skipped) => {
                warn!(topic = %topic, skipped, "Upstream receiver lagged, events skipped");
            }
            Upstream::Closed => self.close_topic(topic),
        }
    }

    fn fan_out(&mut self, topic: &str, event: &BusEvent) {
        self.metrics.record_event();

        let mut delivered = 0;
        let mut gone = Vec::new();

        // A topic may be shared by several kinds
        for sub in self
            .index
            .values()
            .flat_map(|bucket| bucket.values())
            .filter(|sub| sub.topic() == topic)
        {
            // Criteria that never match would otherwise hide a dead consumer
            if sub.is_closed() {
                gone.push(sub.id().clone());
                continue;
            }
            let notification = match sub.matches(&event.data) {
                Ok(Some(notification)) => notification,
                Ok(None) => continue,
                Err(e) => {
                    self.metrics.record_transient_error();
                    warn!(topic = %topic, id = %sub.id(), error = %e, "Skipping event");
                    continue;
                }
            };

            match sub.send(notification) {
                Ok(true) => delivered += 1,
                Ok(false) => gone.push(sub.id().clone()),
                Err(e) => {
                    self.metrics.record_transient_error();
                    warn!(topic = %topic, id = %sub.id(), error = %e, "Skipping event");
                }
            }
        }

        self.metrics.record_delivered(delivered);
        trace!(topic = %topic, payload = event.data.name(), delivered, "Event dispatched");

        for id in gone {
            debug!(id = %id, "Subscriber gone, removing subscription");
            self.uninstall(&id, SubscriptionError::Closed);
        }
    }

    /// The bus closed `topic` under us; fail only its subscriptions.
    fn close_topic(&mut self, topic: &str) {
        if self.topic_chans.remove(topic).is_none() {
            return;
        }
        self.upstream.remove(topic);

        let affected: Vec<SubscriptionId> = self
            .index
            .values()
            .flat_map(|bucket| bucket.values())
            .filter(|sub| sub.topic() == topic)
            .map(|sub| sub.id().clone())
            .collect();

        for id in &affected {
            if let Some(sub) = self.remove(id) {
                self.metrics.record_uninstall();
                sub.close(SubscriptionError::TopicClosed {
                    topic: topic.to_string(),
                });
            }
        }

        self.metrics.record_topic_released();
        self.publish_view();
        warn!(topic = %topic, affected = affected.len(), "Upstream topic closed");
    }

    fn shutdown_all(&mut self) {
        let subscriptions: usize = self.index.values().map(|bucket| bucket.len()).sum();
        info!(
            subscriptions,
            topics = self.topic_chans.len(),
            "Event system shutting down"
        );

        // Refuse anything still queued
        self.install_rx.close();
        while let Ok(sub) = self.install_rx.try_recv() {
            self.metrics.record_rejected();
            sub.close(SubscriptionError::Shutdown);
        }
        self.uninstall_rx.close();

        for (_, bucket) in self.index.drain() {
            for (_, sub) in bucket {
                self.metrics.record_uninstall();
                sub.close(SubscriptionError::Shutdown);
            }
        }

        let topics: Vec<String> = self.topic_chans.drain().map(|(topic, _)| topic).collect();
        for topic in topics {
            self.upstream.remove(&topic);
            self.bus.unsubscribe(&topic);
            self.metrics.record_topic_released();
            debug!(topic = %topic, "Upstream topic released on shutdown");
        }

        self.publish_view();
        let _ = self.terminated.send(true);
        info!("Event system stopped");
    }

    fn publish_view(&self) {
        *self.topics_view.write() = self.topic_chans.clone();
    }
}
