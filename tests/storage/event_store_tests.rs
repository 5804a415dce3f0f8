//! Event store contract tests.
//!
//! These tests verify the behavior every stream backend must provide.
//! Each test takes a fresh key prefix so runs against a shared server do
//! not see each other's streams.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use eventlog::config::{ConsumerConfig, StreamConfig};
use eventlog::{
    handler_fn, DomainEvent, Event, EventCodec, EventConsumer, EventStore, StoreError,
    StreamBackend,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub sku: String,
    pub quantity: u32,
}

impl DomainEvent for ItemAdded {
    const EVENT_TYPE: &'static str = "ItemAdded";
}

/// A unique key prefix for one test.
pub fn test_prefix() -> String {
    format!("test_{}:", &Uuid::new_v4().simple().to_string()[..8])
}

fn stream_config(prefix: &str) -> StreamConfig {
    StreamConfig {
        stream_prefix: prefix.to_string(),
        read_batch_size: 3,
        subscription_block_ms: 50,
        ..Default::default()
    }
}

fn codec() -> Arc<EventCodec> {
    let codec = EventCodec::new();
    codec.register::<ItemAdded>();
    Arc::new(codec)
}

pub fn make_store(backend: &Arc<dyn StreamBackend>, prefix: &str) -> EventStore {
    EventStore::new(Arc::clone(backend), codec(), stream_config(prefix))
}

fn make_consumer(backend: &Arc<dyn StreamBackend>, prefix: &str, name: &str) -> EventConsumer {
    EventConsumer::new(
        Arc::clone(backend),
        codec(),
        &stream_config(prefix),
        ConsumerConfig {
            consumer_name: name.to_string(),
            claim_idle_timeout_ms: 100,
            poll_timeout_ms: 50,
            max_batch_size: 10,
            ..Default::default()
        },
    )
}

/// Events for versions `start..start + count` of one aggregate.
pub fn make_events(aggregate_id: Uuid, start: i64, count: i64) -> Vec<Event> {
    (start..start + count)
        .map(|version| {
            Event::new(
                aggregate_id,
                version,
                ItemAdded {
                    sku: format!("sku-{}", version),
                    quantity: version as u32 + 1,
                },
            )
        })
        .collect()
}

// =============================================================================
// append / read
// =============================================================================

pub async fn test_append_and_read(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let id = Uuid::new_v4();
    let events = make_events(id, 0, 5);

    let version = store
        .append_to_stream(&events, id, -1)
        .await
        .expect("append should succeed");
    assert_eq!(version, 4);

    let read = store
        .read_from_stream(id, 0, None)
        .await
        .expect("read should succeed");
    assert_eq!(read.len(), 5, "should read 5 events");
    for (expected, actual) in events.iter().zip(&read) {
        assert_eq!(actual.event_id, expected.event_id);
        assert_eq!(actual.version, expected.version);
        assert_eq!(actual.timestamp, expected.timestamp);
        assert_eq!(
            actual.payload::<ItemAdded>(),
            expected.payload::<ItemAdded>()
        );
    }
}

pub async fn test_sequential_batches(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let id = Uuid::new_v4();

    assert_eq!(store.append_to_stream(&make_events(id, 0, 2), id, -1).await.unwrap(), 1);
    assert_eq!(store.append_to_stream(&make_events(id, 2, 3), id, 1).await.unwrap(), 4);
    assert_eq!(store.get_stream_version(id).await.unwrap(), 4);

    let versions: Vec<i64> = store
        .read_from_stream(id, 0, None)
        .await
        .unwrap()
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![0, 1, 2, 3, 4]);
}

pub async fn test_version_conflict(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let id = Uuid::new_v4();
    store.append_to_stream(&make_events(id, 0, 3), id, -1).await.unwrap();

    let result = store.append_to_stream(&make_events(id, 1, 1), id, 0).await;
    match result {
        Err(StoreError::ConcurrencyConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 2);
        }
        other => panic!("expected concurrency conflict, got {:?}", other),
    }

    assert_eq!(store.read_from_stream(id, 0, None).await.unwrap().len(), 3);
}

pub async fn test_conflict_from_second_writer(backend: &Arc<dyn StreamBackend>) {
    let prefix = test_prefix();
    let first = make_store(backend, &prefix);
    let second = make_store(backend, &prefix);
    let id = Uuid::new_v4();

    first.append_to_stream(&make_events(id, 0, 1), id, -1).await.unwrap();
    assert_eq!(second.get_stream_version(id).await.unwrap(), 0);
    first.append_to_stream(&make_events(id, 1, 1), id, 0).await.unwrap();

    // The second store's cached version is stale; the backend rejects it.
    let result = second.append_to_stream(&make_events(id, 1, 1), id, 0).await;
    assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
    assert_eq!(second.get_stream_version(id).await.unwrap(), 1);
}

pub async fn test_concurrent_writers_one_wins(backend: &Arc<dyn StreamBackend>) {
    let prefix = test_prefix();
    let id = Uuid::new_v4();
    let stores: Vec<Arc<EventStore>> = (0..4)
        .map(|_| Arc::new(make_store(backend, &prefix)))
        .collect();

    let tasks: Vec<_> = stores
        .iter()
        .map(|store| {
            let store = Arc::clone(store);
            tokio::spawn(async move { store.append_to_stream(&make_events(id, 0, 1), id, -1).await })
        })
        .collect();

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(StoreError::ConcurrencyConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(successes, 1, "exactly one writer should win");
    assert_eq!(stores[0].read_from_stream(id, 0, None).await.unwrap().len(), 1);
}

pub async fn test_missing_stream(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let id = Uuid::new_v4();

    assert_eq!(store.get_stream_version(id).await.unwrap(), -1);
    assert!(store.read_from_stream(id, 0, None).await.unwrap().is_empty());
}

pub async fn test_read_version_window(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let id = Uuid::new_v4();
    store.append_to_stream(&make_events(id, 0, 8), id, -1).await.unwrap();

    let versions: Vec<i64> = store
        .read_from_stream(id, 2, Some(5))
        .await
        .unwrap()
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![2, 3, 4, 5]);

    assert!(store.read_from_stream(id, 8, None).await.unwrap().is_empty());
}

pub async fn test_global_stream(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    store.append_to_stream(&make_events(a, 0, 2), a, -1).await.unwrap();
    store.append_to_stream(&make_events(b, 0, 1), b, -1).await.unwrap();
    store.append_to_stream(&make_events(a, 2, 1), a, 1).await.unwrap();

    let all = store.read_all_events(0, None).await.unwrap();
    let order: Vec<(Uuid, i64)> = all.iter().map(|e| (e.aggregate_id, e.version)).collect();
    assert_eq!(order, vec![(a, 0), (a, 1), (b, 0), (a, 2)]);

    let page = store.read_all_events(1, Some(2)).await.unwrap();
    let order: Vec<(Uuid, i64)> = page.iter().map(|e| (e.aggregate_id, e.version)).collect();
    assert_eq!(order, vec![(a, 1), (b, 0)]);
}

// =============================================================================
// subscriptions
// =============================================================================

pub async fn test_subscribe_to_stream(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let id = Uuid::new_v4();
    store.append_to_stream(&make_events(id, 0, 2), id, -1).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = store.subscribe_to_stream(
        id,
        1,
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.version);
                Ok(())
            }
        }),
    );

    store.append_to_stream(&make_events(id, 2, 1), id, 1).await.unwrap();

    let mut versions = Vec::new();
    while versions.len() < 2 {
        let version = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("subscription should deliver")
            .expect("listener should be running");
        versions.push(version);
    }
    assert_eq!(versions, vec![1, 2]);

    subscription.unsubscribe();
    assert!(!subscription.is_active());
}

pub async fn test_subscribe_to_all(backend: &Arc<dyn StreamBackend>) {
    let store = make_store(backend, &test_prefix());
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    store.append_to_stream(&make_events(a, 0, 1), a, -1).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = store.subscribe_to_all(
        1,
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.aggregate_id);
                Ok(())
            }
        }),
    );

    store.append_to_stream(&make_events(b, 0, 1), b, -1).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("subscription should deliver")
        .expect("listener should be running");
    assert_eq!(received, b);

    drop(subscription);
}

// =============================================================================
// consumer groups
// =============================================================================

pub async fn test_consumer_group_delivery(backend: &Arc<dyn StreamBackend>) {
    let prefix = test_prefix();
    let store = make_store(backend, &prefix);
    let consumer = make_consumer(backend, &prefix, "consumer-a");

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer.register_event_handler(
        ItemAdded::EVENT_TYPE,
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.event_id);
                Ok(())
            }
        }),
    );

    consumer.init().await;
    consumer.init().await;

    let id = Uuid::new_v4();
    let events = make_events(id, 0, 2);
    store.append_to_stream(&events, id, -1).await.unwrap();

    consumer.poll_events().await;

    assert_eq!(rx.try_recv().unwrap(), events[0].event_id);
    assert_eq!(rx.try_recv().unwrap(), events[1].event_id);
    assert_eq!(
        backend
            .pending_count(consumer.stream_key(), &consumer.config().consumer_group)
            .await
            .unwrap(),
        0
    );
}

pub async fn test_consumer_crash_recovery(backend: &Arc<dyn StreamBackend>) {
    let prefix = test_prefix();
    let store = make_store(backend, &prefix);
    let crashed = make_consumer(backend, &prefix, "consumer-a");
    let survivor = make_consumer(backend, &prefix, "consumer-b");

    let (tx, mut rx) = mpsc::unbounded_channel();
    survivor.register_all_events_handler(handler_fn(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.event_id);
            Ok(())
        }
    }));

    crashed.init().await;
    survivor.init().await;

    let id = Uuid::new_v4();
    let events = make_events(id, 0, 1);
    store.append_to_stream(&events, id, -1).await.unwrap();

    // consumer-a takes delivery and dies before acknowledging.
    let group = &crashed.config().consumer_group;
    let delivered = backend
        .read_group(crashed.stream_key(), group, "consumer-a", 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    assert_eq!(survivor.claim_pending_messages().await, 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(survivor.claim_pending_messages().await, 1);

    assert_eq!(rx.try_recv().unwrap(), events[0].event_id);
    assert_eq!(
        backend.pending_count(survivor.stream_key(), group).await.unwrap(),
        0
    );
}

/// Run the full contract suite against a backend.
#[macro_export]
macro_rules! run_event_store_tests {
    ($backend:expr) => {
        use $crate::storage::event_store_tests::*;

        test_append_and_read($backend).await;
        println!("  test_append_and_read: PASSED");

        test_sequential_batches($backend).await;
        println!("  test_sequential_batches: PASSED");

        test_version_conflict($backend).await;
        println!("  test_version_conflict: PASSED");

        test_conflict_from_second_writer($backend).await;
        println!("  test_conflict_from_second_writer: PASSED");

        test_concurrent_writers_one_wins($backend).await;
        println!("  test_concurrent_writers_one_wins: PASSED");

        test_missing_stream($backend).await;
        println!("  test_missing_stream: PASSED");

        test_read_version_window($backend).await;
        println!("  test_read_version_window: PASSED");

        test_global_stream($backend).await;
        println!("  test_global_stream: PASSED");

        test_subscribe_to_stream($backend).await;
        println!("  test_subscribe_to_stream: PASSED");

        test_subscribe_to_all($backend).await;
        println!("  test_subscribe_to_all: PASSED");

        test_consumer_group_delivery($backend).await;
        println!("  test_consumer_group_delivery: PASSED");

        test_consumer_crash_recovery($backend).await;
        println!("  test_consumer_crash_recovery: PASSED");
    };
}
