//! Subscription value object and its client-side receiver.
//!
//! A [`Subscription`] is created off the control loop together with its
//! [`SubscriptionReceiver`]. The subscription half is handed to the event
//! system, which owns it from then on; the client keeps the receiver.
//!
//! ```text
//!   Subscription::new ──┬──→ Subscription ──→ EventSystem (install intake)
//!                       │        │ delivery / installed / err
//!                       │        ▼
//!                       └──→ SubscriptionReceiver (client)
//! ```
//!
//! Delivery is a bounded broadcast channel with one receiver. When the
//! buffer is full the oldest unread notification is overwritten, so a slow
//! client only ever sees gaps, and the control loop never waits on it.

use super::criteria::{FilterCriteria, MAX_TOPICS};
use super::kind::SubscriptionKind;
use crate::error::{EventError, FilterError, SubscriptionError};
use serde::{Deserialize, Serialize};
use shared_bus::{EventData, TxEvent};
use shared_types::{Hash, Header, Log};
use std::borrow::Cow;
use std::fmt;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Unique subscription identifier (`0x`-prefixed hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(format!("0x{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SubscriptionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SubscriptionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery to a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Notification {
    /// Logs of one transaction that matched the criteria
    Logs(Vec<Log>),
    /// A newly committed header
    Header(Header),
    /// Hashes of newly executed transactions
    Hashes(Vec<Hash>),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Logs(_) => "logs",
            Notification::Header(_) => "header",
            Notification::Hashes(_) => "hashes",
        }
    }
}

/// Send half of the typed delivery channel; one variant per kind.
enum DeliverySender {
    Logs(broadcast::Sender<Vec<Log>>),
    Header(broadcast::Sender<Header>),
    Hashes(broadcast::Sender<Vec<Hash>>),
}

enum DeliveryReceiver {
    Logs(broadcast::Receiver<Vec<Log>>),
    Header(broadcast::Receiver<Header>),
    Hashes(broadcast::Receiver<Vec<Hash>>),
}

fn delivery_channel(kind: SubscriptionKind, buffer: usize) -> (DeliverySender, DeliveryReceiver) {
    // broadcast::channel panics on zero capacity
    let buffer = buffer.max(1);
    match kind {
        SubscriptionKind::Logs => {
            let (tx, rx) = broadcast::channel(buffer);
            (DeliverySender::Logs(tx), DeliveryReceiver::Logs(rx))
        }
        SubscriptionKind::NewHeads => {
            let (tx, rx) = broadcast::channel(buffer);
            (DeliverySender::Header(tx), DeliveryReceiver::Header(rx))
        }
        SubscriptionKind::PendingTransactions => {
            let (tx, rx) = broadcast::channel(buffer);
            (DeliverySender::Hashes(tx), DeliveryReceiver::Hashes(rx))
        }
    }
}

impl DeliveryReceiver {
    async fn recv(&mut self) -> Result<Notification, RecvError> {
        match self {
            DeliveryReceiver::Logs(rx) => rx.recv().await.map(Notification::Logs),
            DeliveryReceiver::Header(rx) => rx.recv().await.map(Notification::Header),
            DeliveryReceiver::Hashes(rx) => rx.recv().await.map(Notification::Hashes),
        }
    }
}

/// Enqueues uninstalls on the event system's intake.
#[derive(Debug, Clone)]
pub struct Unsubscriber {
    tx: mpsc::UnboundedSender<SubscriptionId>,
}

impl Unsubscriber {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SubscriptionId>) -> Self {
        Self { tx }
    }

    /// Request removal of `id`. A stopped system or an unknown id is ignored.
    pub fn unsubscribe(&self, id: &SubscriptionId) {
        let _ = self.tx.send(id.clone());
    }
}

/// One live client subscription, as owned by the event system.
pub struct Subscription {
    id: SubscriptionId,
    kind: SubscriptionKind,
    topic: String,
    criteria: Option<FilterCriteria>,
    created: Instant,
    delivery: DeliverySender,
    installed: Option<oneshot::Sender<()>>,
    err: Option<oneshot::Sender<SubscriptionError>>,
}

impl Subscription {
    /// Create a subscription on the topic derived from `kind`.
    ///
    /// # Errors
    ///
    /// - `CriteriaNotAllowed` if non-empty criteria are given for a kind
    ///   other than logs
    /// - any criteria validation error (pending bound, bad range, too many
    ///   topic slots)
    pub fn new(
        kind: SubscriptionKind,
        criteria: Option<FilterCriteria>,
        buffer: usize,
    ) -> Result<(Subscription, SubscriptionReceiver), FilterError> {
        Self::with_topic(kind, criteria, kind.topic(), buffer)
    }

    /// Create a subscription on an explicit upstream topic.
    pub fn with_topic(
        kind: SubscriptionKind,
        criteria: Option<FilterCriteria>,
        topic: impl Into<String>,
        buffer: usize,
    ) -> Result<(Subscription, SubscriptionReceiver), FilterError> {
        let criteria = match criteria {
            Some(c) if !kind.accepts_criteria() => {
                if !c.is_empty() {
                    return Err(FilterError::CriteriaNotAllowed { kind });
                }
                None
            }
            Some(c) => {
                c.validate(MAX_TOPICS, usize::MAX)?;
                Some(c)
            }
            None => None,
        };

        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(FilterError::InvalidCriteria("empty topic".into()));
        }

        let id = SubscriptionId::new();
        let (delivery_tx, delivery_rx) = delivery_channel(kind, buffer);
        let (installed_tx, installed_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();

        let subscription = Subscription {
            id: id.clone(),
            kind,
            topic,
            criteria,
            created: Instant::now(),
            delivery: delivery_tx,
            installed: Some(installed_tx),
            err: Some(err_tx),
        };
        let receiver = SubscriptionReceiver {
            id,
            kind,
            delivery: delivery_rx,
            installed: Some(installed_rx),
            err: err_rx,
            terminal: None,
            unsubscriber: None,
        };
        Ok((subscription, receiver))
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Upstream bus topic this subscription is registered against.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn criteria(&self) -> Option<&FilterCriteria> {
        self.criteria.as_ref()
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Transform an upstream payload into this subscription's notification.
    ///
    /// Returns `Ok(None)` when nothing in the event is of interest (a
    /// transaction with no matching logs).
    pub fn matches(&self, data: &EventData) -> Result<Option<Notification>, EventError> {
        match self.kind {
            SubscriptionKind::Logs => {
                let tx = self.decode_tx(data)?;
                let logs = match &self.criteria {
                    Some(criteria) => criteria.filter_logs(&tx.logs),
                    None => tx.into_owned().logs,
                };
                Ok((!logs.is_empty()).then_some(Notification::Logs(logs)))
            }
            SubscriptionKind::PendingTransactions => {
                let tx = self.decode_tx(data)?;
                Ok(Some(Notification::Hashes(vec![tx.hash])))
            }
            SubscriptionKind::NewHeads => match data {
                EventData::NewBlockHeader(header) => {
                    Ok(Some(Notification::Header(header.clone())))
                }
                EventData::Raw(value) => serde_json::from_value::<Header>(value.clone())
                    .map(|header| Some(Notification::Header(header)))
                    .map_err(|e| EventError::Decode(e.to_string())),
                other => Err(self.mismatch(other)),
            },
        }
    }

    fn decode_tx<'a>(&self, data: &'a EventData) -> Result<Cow<'a, TxEvent>, EventError> {
        match data {
            EventData::Tx(tx) => Ok(Cow::Borrowed(tx)),
            EventData::Raw(value) => serde_json::from_value::<TxEvent>(value.clone())
                .map(Cow::Owned)
                .map_err(|e| EventError::Decode(e.to_string())),
            other => Err(self.mismatch(other)),
        }
    }

    fn mismatch(&self, data: &EventData) -> EventError {
        EventError::PayloadMismatch {
            kind: self.kind,
            payload: data.name(),
        }
    }

    /// True once the client receiver is gone.
    pub(crate) fn is_closed(&self) -> bool {
        match &self.delivery {
            DeliverySender::Logs(tx) => tx.receiver_count() == 0,
            DeliverySender::Header(tx) => tx.receiver_count() == 0,
            DeliverySender::Hashes(tx) => tx.receiver_count() == 0,
        }
    }

    /// Non-blocking delivery. Overwrites the oldest unread entry when full.
    ///
    /// Returns `Ok(false)` once the client receiver is gone.
    pub(crate) fn send(&self, notification: Notification) -> Result<bool, EventError> {
        // send only fails when no receiver is left
        match (&self.delivery, notification) {
            (DeliverySender::Logs(tx), Notification::Logs(logs)) => Ok(tx.send(logs).is_ok()),
            (DeliverySender::Header(tx), Notification::Header(header)) => {
                Ok(tx.send(header).is_ok())
            }
            (DeliverySender::Hashes(tx), Notification::Hashes(hashes)) => {
                Ok(tx.send(hashes).is_ok())
            }
            (_, other) => Err(EventError::PayloadMismatch {
                kind: self.kind,
                payload: other.name(),
            }),
        }
    }

    /// Signal that the subscription is indexed and receiving.
    pub(crate) fn mark_installed(&mut self) {
        if let Some(tx) = self.installed.take() {
            let _ = tx.send(());
        }
    }

    /// Deliver the terminal error and drop every send half.
    pub(crate) fn close(mut self, reason: SubscriptionError) {
        if let Some(tx) = self.err.take() {
            let _ = tx.send(reason);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("topic", &self.topic)
            .field("criteria", &self.criteria)
            .finish_non_exhaustive()
    }
}

/// Client half of a subscription.
///
/// Dropping the receiver enqueues an uninstall of its subscription when it
/// was created through the event system.
pub struct SubscriptionReceiver {
    id: SubscriptionId,
    kind: SubscriptionKind,
    delivery: DeliveryReceiver,
    installed: Option<oneshot::Receiver<()>>,
    err: oneshot::Receiver<SubscriptionError>,
    terminal: Option<SubscriptionError>,
    unsubscriber: Option<Unsubscriber>,
}

impl SubscriptionReceiver {
    pub(crate) fn attach(&mut self, unsubscriber: Unsubscriber) {
        self.unsubscriber = Some(unsubscriber);
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Wait until the event system has indexed the subscription.
    ///
    /// Every event the control loop handles after this returns `Ok` is
    /// considered for delivery.
    pub async fn installed(&mut self) -> Result<(), SubscriptionError> {
        if let Some(err) = &self.terminal {
            return Err(err.clone());
        }
        let Some(rx) = self.installed.take() else {
            return Ok(());
        };
        match rx.await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.take_terminal()),
        }
    }

    /// Receive the next notification.
    ///
    /// Entries overwritten while the client lagged are skipped silently. An
    /// error is terminal; every later call returns the same error.
    pub async fn recv(&mut self) -> Result<Notification, SubscriptionError> {
        if let Some(err) = &self.terminal {
            return Err(err.clone());
        }
        loop {
            match self.delivery.recv().await {
                Ok(notification) => return Ok(notification),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(id = %self.id, skipped, "Subscriber lagged, oldest notifications dropped");
                }
                Err(RecvError::Closed) => return Err(self.take_terminal()),
            }
        }
    }

    /// Terminal error, if one has been signalled, without waiting.
    pub fn try_error(&mut self) -> Option<SubscriptionError> {
        if self.terminal.is_some() {
            return self.terminal.clone();
        }
        match self.err.try_recv() {
            Ok(err) => {
                self.terminal = Some(err.clone());
                Some(err)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.terminal = Some(SubscriptionError::Closed);
                Some(SubscriptionError::Closed)
            }
        }
    }

    /// Cancel the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn take_terminal(&mut self) -> SubscriptionError {
        self.try_error().unwrap_or(SubscriptionError::Closed)
    }
}

impl Drop for SubscriptionReceiver {
    fn drop(&mut self) {
        if let Some(unsubscriber) = self.unsubscriber.take() {
            unsubscriber.unsubscribe(&self.id);
        }
    }
}

impl fmt::Debug for SubscriptionReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionReceiver")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}
