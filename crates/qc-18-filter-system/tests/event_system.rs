//! # Event System Integration Tests
//!
//! Drive the control loop through its public surface against a real
//! in-memory bus wrapped in a counting adapter, so upstream registrations
//! and releases can be asserted exactly.

use parking_lot::Mutex;
use qc_18_filter_system::{
    EventSystem, FilterCriteria, FilterError, FilterSystemConfig, Notification, Subscription,
    SubscriptionError, SubscriptionKind, SubscriptionReceiver, UpstreamBus,
};
use shared_bus::{
    BusError, BusEvent, EventData, EventPublisher, InMemoryEventBus, TopicSubscription, TxEvent,
    EVM_TX_TOPIC, NEW_BLOCK_HEADER_TOPIC,
};
use shared_types::{Address, Hash, Header, Log};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory bus that records every registration and release.
#[derive(Default)]
struct CountingBus {
    inner: InMemoryEventBus,
    subscribes: Mutex<HashMap<String, usize>>,
    unsubscribes: Mutex<HashMap<String, usize>>,
}

impl CountingBus {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribe_calls(&self, topic: &str) -> usize {
        self.subscribes.lock().get(topic).copied().unwrap_or(0)
    }

    fn unsubscribe_calls(&self, topic: &str) -> usize {
        self.unsubscribes.lock().get(topic).copied().unwrap_or(0)
    }

    async fn publish(&self, event: BusEvent) -> usize {
        self.inner.publish(event).await
    }
}

impl UpstreamBus for CountingBus {
    fn subscribe(&self, topic: &str) -> Result<TopicSubscription, BusError> {
        *self.subscribes.lock().entry(topic.to_string()).or_default() += 1;
        self.inner.subscribe(topic)
    }

    fn unsubscribe(&self, topic: &str) {
        *self.unsubscribes.lock().entry(topic.to_string()).or_default() += 1;
        self.inner.unsubscribe(topic);
    }
}

fn start(bus: &Arc<CountingBus>, config: FilterSystemConfig) -> EventSystem {
    init_tracing();
    EventSystem::new(bus.clone(), config).expect("valid config")
}

fn header(number: u64) -> Header {
    Header {
        number,
        hash: Hash::from_low_u64_be(number + 1),
        ..Default::default()
    }
}

fn header_event(topic: &str, number: u64) -> BusEvent {
    BusEvent::new(topic, EventData::NewBlockHeader(header(number)))
}

fn transfer_log(emitter: Address) -> Log {
    Log {
        address: emitter,
        topics: vec![Hash::repeat_byte(0xdd), Hash::repeat_byte(0x01)],
        block_number: 7,
        ..Default::default()
    }
}

async fn next(rx: &mut SubscriptionReceiver) -> Result<Notification, SubscriptionError> {
    timeout(WAIT, rx.recv()).await.expect("notification within timeout")
}

async fn next_number(rx: &mut SubscriptionReceiver) -> u64 {
    match next(rx).await {
        Ok(Notification::Header(header)) => header.number,
        other => panic!("expected header, got {other:?}"),
    }
}

/// Poll `check` until it holds or the wait expires.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached within timeout");
}

#[tokio::test]
async fn test_shared_topic_lifecycle() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    // S1 registers the topic upstream
    let (s1, mut r1) =
        Subscription::with_topic(SubscriptionKind::NewHeads, None, "price-update", 16).unwrap();
    let id1 = s1.id().clone();
    system.subscribe(s1).unwrap();
    r1.installed().await.unwrap();

    assert_eq!(bus.subscribe_calls("price-update"), 1);
    assert_eq!(system.registered_topics(), vec!["price-update".to_string()]);
    let first = system.topic_registration("price-update").unwrap();

    // S2 reuses it
    let (s2, mut r2) =
        Subscription::with_topic(SubscriptionKind::NewHeads, None, "price-update", 16).unwrap();
    let id2 = s2.id().clone();
    system.subscribe(s2).unwrap();
    r2.installed().await.unwrap();

    assert_eq!(bus.subscribe_calls("price-update"), 1);
    let second = system.topic_registration("price-update").unwrap();
    assert_eq!(first.registration, second.registration);
    assert_eq!(second.subscribers, 2);

    bus.publish(header_event("price-update", 1)).await;
    assert_eq!(next_number(&mut r1).await, 1);
    assert_eq!(next_number(&mut r2).await, 1);

    // Only S2 sees events after S1 leaves
    system.unsubscribe(&id1);
    bus.publish(header_event("price-update", 2)).await;
    assert_eq!(next_number(&mut r2).await, 2);
    assert_eq!(next(&mut r1).await, Err(SubscriptionError::Unsubscribed));
    assert_eq!(bus.unsubscribe_calls("price-update"), 0);

    // The last referent releases the registration
    system.unsubscribe(&id2);
    eventually(|| bus.unsubscribe_calls("price-update") == 1).await;
    assert!(system.registered_topics().is_empty());
    assert_eq!(bus.inner.topic_count(), 0);
    assert_eq!(next(&mut r2).await, Err(SubscriptionError::Unsubscribed));
}

#[tokio::test]
async fn test_many_subscribers_one_registration() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    let mut receivers = Vec::new();
    for _ in 0..5 {
        let mut rx = system.subscribe_new_heads().unwrap();
        rx.installed().await.unwrap();
        assert_eq!(bus.subscribe_calls(NEW_BLOCK_HEADER_TOPIC), 1);
        receivers.push(rx);
    }
    assert_eq!(system.subscription_count(), 5);

    // Dropping a receiver uninstalls its subscription
    while receivers.len() > 1 {
        receivers.pop();
        let expected = receivers.len();
        eventually(|| system.subscription_count() == expected).await;
        assert_eq!(bus.unsubscribe_calls(NEW_BLOCK_HEADER_TOPIC), 0);
        assert_eq!(system.registered_topics().len(), 1);
    }

    receivers.clear();
    eventually(|| bus.unsubscribe_calls(NEW_BLOCK_HEADER_TOPIC) == 1).await;
    assert_eq!(bus.subscribe_calls(NEW_BLOCK_HEADER_TOPIC), 1);
    assert!(system.registered_topics().is_empty());

    let snapshot = system.metrics().snapshot();
    assert_eq!(snapshot.installs, 5);
    assert_eq!(snapshot.uninstalls, 5);
    assert_eq!(snapshot.topics_registered, 1);
    assert_eq!(snapshot.topics_released, 1);
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    let mut rx = system.subscribe_pending_transactions().unwrap();
    rx.installed().await.unwrap();
    let id = rx.id().clone();

    system.unsubscribe(&id);
    system.unsubscribe(&id);
    drop(rx);
    system.unsubscribe(&"0xunknown".into());

    eventually(|| bus.unsubscribe_calls(EVM_TX_TOPIC) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bus.unsubscribe_calls(EVM_TX_TOPIC), 1);
    assert_eq!(system.metrics().snapshot().uninstalls, 1);
    assert!(system.is_running());
}

#[tokio::test]
async fn test_logs_and_hashes_share_tx_topic() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());
    let token = Address::repeat_byte(0xaa);

    let criteria = FilterCriteria::new()
        .with_address(token)
        .with_topic(0, vec![Hash::repeat_byte(0xdd)]);
    let mut logs = system.subscribe_logs(criteria).unwrap();
    let mut hashes = system.subscribe_pending_transactions().unwrap();
    logs.installed().await.unwrap();
    hashes.installed().await.unwrap();

    assert_eq!(bus.subscribe_calls(EVM_TX_TOPIC), 1);
    assert_eq!(system.topic_registration(EVM_TX_TOPIC).unwrap().subscribers, 2);

    // First transaction has nothing for the log filter
    let unrelated = TxEvent {
        hash: Hash::repeat_byte(1),
        height: 7,
        index: 0,
        logs: vec![transfer_log(Address::repeat_byte(0xbb))],
    };
    let matching = TxEvent {
        hash: Hash::repeat_byte(2),
        height: 7,
        index: 1,
        logs: vec![
            transfer_log(token),
            transfer_log(Address::repeat_byte(0xbb)),
        ],
    };
    bus.publish(BusEvent::evm_tx(unrelated)).await;
    bus.publish(BusEvent::evm_tx(matching)).await;

    assert_eq!(
        next(&mut hashes).await,
        Ok(Notification::Hashes(vec![Hash::repeat_byte(1)]))
    );
    assert_eq!(
        next(&mut hashes).await,
        Ok(Notification::Hashes(vec![Hash::repeat_byte(2)]))
    );
    assert_eq!(
        next(&mut logs).await,
        Ok(Notification::Logs(vec![transfer_log(token)]))
    );
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_fan_out() {
    let bus = CountingBus::new();
    let config = FilterSystemConfig {
        delivery_buffer: 2,
        ..Default::default()
    };
    let system = start(&bus, config);

    let mut slow = system.subscribe_new_heads().unwrap();
    let mut fast = system.subscribe_new_heads().unwrap();
    slow.installed().await.unwrap();
    fast.installed().await.unwrap();

    for number in 0..10 {
        bus.publish(header_event(NEW_BLOCK_HEADER_TOPIC, number)).await;
        assert_eq!(next_number(&mut fast).await, number);
    }

    // Only the newest entries survive in the slow buffer
    assert_eq!(next_number(&mut slow).await, 8);
    assert_eq!(next_number(&mut slow).await, 9);
    assert_eq!(system.subscription_count(), 2);
}

#[tokio::test]
async fn test_malformed_event_is_skipped() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    let mut rx = system.subscribe_new_heads().unwrap();
    rx.installed().await.unwrap();

    let junk = BusEvent::new(
        NEW_BLOCK_HEADER_TOPIC,
        EventData::Raw(serde_json::json!("not a header")),
    );
    bus.publish(junk).await;
    let raw_header = BusEvent::new(
        NEW_BLOCK_HEADER_TOPIC,
        EventData::Raw(serde_json::to_value(header(4)).unwrap()),
    );
    bus.publish(raw_header).await;

    assert_eq!(next_number(&mut rx).await, 4);
    assert_eq!(system.metrics().snapshot().transient_errors, 1);
    assert_eq!(rx.try_error(), None);
}

#[tokio::test]
async fn test_closed_topic_fails_only_its_subscriptions() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    let mut heads = system.subscribe_new_heads().unwrap();
    let mut hashes = system.subscribe_pending_transactions().unwrap();
    heads.installed().await.unwrap();
    hashes.installed().await.unwrap();

    // Bus drops the header topic on its own
    assert!(bus.inner.unsubscribe(NEW_BLOCK_HEADER_TOPIC));

    assert_eq!(
        next(&mut heads).await,
        Err(SubscriptionError::TopicClosed {
            topic: NEW_BLOCK_HEADER_TOPIC.to_string()
        })
    );
    eventually(|| system.registered_topics() == vec![EVM_TX_TOPIC.to_string()]).await;

    bus.publish(BusEvent::evm_tx(TxEvent::default())).await;
    assert_eq!(
        next(&mut hashes).await,
        Ok(Notification::Hashes(vec![Hash::zero()]))
    );
    assert_eq!(bus.unsubscribe_calls(NEW_BLOCK_HEADER_TOPIC), 0);

    // A new subscription registers the topic again
    let mut again = system.subscribe_new_heads().unwrap();
    again.installed().await.unwrap();
    assert_eq!(bus.subscribe_calls(NEW_BLOCK_HEADER_TOPIC), 2);
}

#[tokio::test]
async fn test_consumer_exit_releases_topic() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    // No unsubscriber attached: only a failed delivery can notice the exit
    let (sub, mut rx) = Subscription::new(SubscriptionKind::NewHeads, None, 4).unwrap();
    system.subscribe(sub).unwrap();
    rx.installed().await.unwrap();
    drop(rx);

    bus.publish(header_event(NEW_BLOCK_HEADER_TOPIC, 1)).await;
    eventually(|| bus.unsubscribe_calls(NEW_BLOCK_HEADER_TOPIC) == 1).await;
    assert_eq!(system.subscription_count(), 0);
}

#[tokio::test]
async fn test_consumer_exit_detected_without_matches() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    let criteria = FilterCriteria::new().with_address(Address::repeat_byte(0xaa));
    let (sub, mut rx) = Subscription::new(SubscriptionKind::Logs, Some(criteria), 4).unwrap();
    system.subscribe(sub).unwrap();
    rx.installed().await.unwrap();
    drop(rx);

    // Nothing on the topic ever matches the criteria
    for height in 1..=5 {
        let tx = TxEvent {
            hash: Hash::from_low_u64_be(height),
            height,
            ..Default::default()
        };
        bus.publish(BusEvent::evm_tx(tx)).await;
    }

    eventually(|| bus.unsubscribe_calls(EVM_TX_TOPIC) == 1).await;
    assert_eq!(system.subscription_count(), 0);
    assert!(system.registered_topics().is_empty());
}

#[tokio::test]
async fn test_shutdown_notifies_everyone() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());

    let mut heads = system.subscribe_new_heads().unwrap();
    let mut logs = system.subscribe_logs(FilterCriteria::new()).unwrap();
    heads.installed().await.unwrap();
    logs.installed().await.unwrap();

    system.shutdown();
    timeout(WAIT, system.stopped()).await.expect("loop stops");

    assert!(!system.is_running());
    assert_eq!(next(&mut heads).await, Err(SubscriptionError::Shutdown));
    assert_eq!(next(&mut logs).await, Err(SubscriptionError::Shutdown));
    assert_eq!(bus.unsubscribe_calls(NEW_BLOCK_HEADER_TOPIC), 1);
    assert_eq!(bus.unsubscribe_calls(EVM_TX_TOPIC), 1);
    assert_eq!(bus.inner.topic_count(), 0);
    assert!(system.registered_topics().is_empty());

    assert_eq!(
        system.subscribe_new_heads().unwrap_err(),
        FilterError::SystemStopped
    );
    // Repeated shutdown is harmless
    system.shutdown();
}

#[tokio::test]
async fn test_governing_context_cancellation() {
    init_tracing();
    let bus = CountingBus::new();
    let (cancel, governed) = watch::channel(false);
    let system =
        EventSystem::with_shutdown(bus.clone(), FilterSystemConfig::default(), governed).unwrap();

    let mut rx = system.subscribe_new_heads().unwrap();
    rx.installed().await.unwrap();

    cancel.send(true).unwrap();
    timeout(WAIT, system.stopped()).await.expect("loop stops");
    assert_eq!(next(&mut rx).await, Err(SubscriptionError::Shutdown));
}

#[tokio::test]
async fn test_light_mode_rejects_logs() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::light());
    assert!(system.is_light_mode());

    let err = system.subscribe_logs(FilterCriteria::new()).unwrap_err();
    assert_eq!(
        err,
        FilterError::LightModeUnsupported {
            kind: SubscriptionKind::Logs
        }
    );
    assert_eq!(bus.subscribe_calls(EVM_TX_TOPIC), 0);

    let mut heads = system.subscribe_new_heads().unwrap();
    heads.installed().await.unwrap();
    assert_eq!(system.metrics().snapshot().rejected, 1);
}

#[tokio::test]
async fn test_limits_checked_before_install() {
    let bus = CountingBus::new();
    let config = FilterSystemConfig {
        max_topics_per_filter: 2,
        ..Default::default()
    };
    let system = start(&bus, config);

    let criteria = FilterCriteria::new().with_topics(vec![vec![], vec![], vec![]]);
    assert_eq!(
        system.subscribe_logs(criteria).unwrap_err(),
        FilterError::TooManyTopics { count: 3, max: 2 }
    );

    let criteria = FilterCriteria::new().with_address(Address::zero());
    assert_eq!(
        system
            .subscribe_kind(SubscriptionKind::PendingTransactions, Some(criteria))
            .unwrap_err(),
        FilterError::CriteriaNotAllowed {
            kind: SubscriptionKind::PendingTransactions
        }
    );
    assert_eq!(bus.subscribe_calls(EVM_TX_TOPIC), 0);
}

#[tokio::test]
async fn test_upstream_failure_reported_on_install() {
    let bus = CountingBus::new();
    let system = start(&bus, FilterSystemConfig::default());
    bus.inner.close();

    let mut rx = system.subscribe_new_heads().unwrap();
    match timeout(WAIT, rx.installed()).await.expect("install outcome") {
        Err(SubscriptionError::Upstream(_)) => {}
        other => panic!("expected upstream failure, got {other:?}"),
    }
    assert!(system.registered_topics().is_empty());
    assert!(system.is_running());
}

#[test]
fn test_invalid_config_rejected() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let config = FilterSystemConfig {
            delivery_buffer: 0,
            ..Default::default()
        };
        let err = EventSystem::new(Arc::new(InMemoryEventBus::new()), config).unwrap_err();
        assert!(matches!(err, FilterError::InvalidConfig(_)));
    });
}
