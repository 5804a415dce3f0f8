use super::*;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{DomainEvent, Event, EVENT_DATA_FIELD};
use crate::config::AckPolicy;
use crate::handler::{handler_fn, HandlerError};
use crate::storage::MemoryStreamBackend;
use crate::store::EventStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    sku: String,
}

impl DomainEvent for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderShipped {
    carrier: String,
}

impl DomainEvent for OrderShipped {
    const EVENT_TYPE: &'static str = "OrderShipped";
}

fn codec() -> Arc<EventCodec> {
    let codec = EventCodec::new();
    codec.register::<OrderPlaced>();
    codec.register::<OrderShipped>();
    Arc::new(codec)
}

fn consumer_config(name: &str) -> ConsumerConfig {
    ConsumerConfig {
        consumer_name: name.to_string(),
        claim_idle_timeout_ms: 50,
        poll_interval_ms: 10,
        poll_timeout_ms: 0,
        max_batch_size: 10,
        ..Default::default()
    }
}

fn new_consumer(backend: &MemoryStreamBackend, config: ConsumerConfig) -> EventConsumer {
    EventConsumer::new(
        Arc::new(backend.clone()),
        codec(),
        &StreamConfig::default(),
        config,
    )
}

fn new_store(backend: &MemoryStreamBackend) -> EventStore {
    EventStore::new(Arc::new(backend.clone()), codec(), StreamConfig::default())
}

async fn place_order(store: &EventStore, sku: &str) -> Event {
    let aggregate_id = Uuid::new_v4();
    let event = Event::new(
        aggregate_id,
        0,
        OrderPlaced {
            sku: sku.to_string(),
        },
    );
    store.append_event(&event, aggregate_id, -1).await.unwrap();
    event
}

async fn pending(consumer: &EventConsumer, backend: &MemoryStreamBackend) -> u64 {
    backend
        .pending_count(consumer.stream_key(), &consumer.config().consumer_group)
        .await
        .unwrap()
}

fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn EventHandler> {
    let log = Arc::clone(log);
    handler_fn(move |_| {
        let log = Arc::clone(&log);
        async move {
            log.lock().push(name);
            Ok(())
        }
    })
}

fn failing() -> Arc<dyn EventHandler> {
    handler_fn(|_| async { Err(HandlerError::failed("downstream unavailable")) })
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(&backend, consumer_config("event-consumer"));

    consumer.init().await;
    consumer.init().await;

    assert!(backend.exists(consumer.stream_key()).await.unwrap());
    assert_eq!(pending(&consumer, &backend).await, 0);
    assert_eq!(consumer.metrics().snapshot().consumer.errors, 0);
}

#[tokio::test]
async fn test_poll_without_group_is_benign() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(
        &backend,
        ConsumerConfig {
            create_consumer_group: false,
            ..consumer_config("event-consumer")
        },
    );
    let store = new_store(&backend);

    consumer.init().await;
    place_order(&store, "sku-1").await;
    consumer.poll_events().await;

    assert!(matches!(
        backend
            .pending_count(consumer.stream_key(), "event-processors")
            .await,
        Err(BackendError::NoGroup { .. })
    ));
    let snapshot = consumer.metrics().snapshot().consumer;
    assert_eq!(snapshot.polls, 1);
    assert_eq!(snapshot.errors, 0);
}

#[tokio::test]
async fn test_dispatch_order_and_ack() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(&backend, consumer_config("event-consumer"));
    let store = new_store(&backend);
    let log = Arc::new(Mutex::new(Vec::new()));

    consumer.register_all_events_handler(recording(&log, "all"));
    consumer.register_event_handler("OrderPlaced", recording(&log, "placed-1"));
    consumer.register_event_handler("OrderShipped", recording(&log, "shipped"));
    consumer.register_event_handler("OrderPlaced", recording(&log, "placed-2"));

    consumer.init().await;
    place_order(&store, "sku-1").await;
    consumer.poll_events().await;

    assert_eq!(*log.lock(), vec!["placed-1", "placed-2", "all"]);
    assert_eq!(pending(&consumer, &backend).await, 0);

    let snapshot = consumer.metrics().snapshot().consumer;
    assert_eq!(snapshot.records_processed, 1);
    assert_eq!(snapshot.records_acknowledged, 1);
}

#[tokio::test]
async fn test_events_before_group_creation_are_not_delivered() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(&backend, consumer_config("event-consumer"));
    let store = new_store(&backend);
    let log = Arc::new(Mutex::new(Vec::new()));
    consumer.register_all_events_handler(recording(&log, "all"));

    place_order(&store, "early").await;
    consumer.init().await;
    place_order(&store, "late").await;
    consumer.poll_events().await;

    assert_eq!(log.lock().len(), 1);
}

#[tokio::test]
async fn test_sentinel_is_acked_without_dispatch() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(&backend, consumer_config("event-consumer"));
    let log = Arc::new(Mutex::new(Vec::new()));
    consumer.register_all_events_handler(recording(&log, "all"));
    consumer.init().await;

    backend
        .append(consumer.stream_key(), &WireRecord::sentinel())
        .await
        .unwrap();
    let entries = backend
        .read_group(
            consumer.stream_key(),
            "event-processors",
            "event-consumer",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);

    let result = consumer.process_record(&entries[0]).await;

    assert_eq!(result, DispatchResult::Sentinel);
    assert!(log.lock().is_empty());
    assert_eq!(pending(&consumer, &backend).await, 0);
}

#[tokio::test]
async fn test_malformed_payload_is_acked() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(&backend, consumer_config("event-consumer"));
    let store = new_store(&backend);
    let event = Event::new(
        Uuid::new_v4(),
        0,
        OrderPlaced {
            sku: "sku-1".to_string(),
        },
    );
    let mut record = store.codec().serialize(&event).unwrap();
    record.insert(EVENT_DATA_FIELD, "{not json");

    consumer.init().await;
    backend.append(consumer.stream_key(), &record).await.unwrap();
    consumer.poll_events().await;

    assert_eq!(pending(&consumer, &backend).await, 0);
    let snapshot = consumer.metrics().snapshot().consumer;
    assert_eq!(snapshot.decode_failures, 1);
    assert_eq!(snapshot.records_processed, 0);
}

#[tokio::test]
async fn test_unknown_event_type_left_for_registered_peer() {
    let backend = MemoryStreamBackend::new();
    let outdated = EventConsumer::new(
        Arc::new(backend.clone()),
        Arc::new(EventCodec::new()),
        &StreamConfig::default(),
        consumer_config("consumer-a"),
    );
    let peer = new_consumer(&backend, consumer_config("consumer-b"));
    let store = new_store(&backend);

    let (tx, mut rx) = mpsc::unbounded_channel();
    peer.register_event_handler(
        "OrderPlaced",
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.event_id);
                Ok(())
            }
        }),
    );

    outdated.init().await;
    let event = place_order(&store, "sku-1").await;
    outdated.poll_events().await;

    assert_eq!(pending(&outdated, &backend).await, 1);
    assert_eq!(outdated.metrics().snapshot().consumer.decode_failures, 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(peer.claim_pending_messages().await, 1);

    assert_eq!(rx.try_recv().unwrap(), event.event_id);
    assert_eq!(pending(&peer, &backend).await, 0);
}

#[tokio::test]
async fn test_failed_handler_acked_under_always_policy() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(&backend, consumer_config("event-consumer"));
    let store = new_store(&backend);
    let log = Arc::new(Mutex::new(Vec::new()));

    consumer.register_event_handler("OrderPlaced", failing());
    consumer.register_all_events_handler(recording(&log, "all"));
    consumer.init().await;
    place_order(&store, "sku-1").await;
    consumer.poll_events().await;

    assert_eq!(*log.lock(), vec!["all"]);
    assert_eq!(pending(&consumer, &backend).await, 0);
    assert_eq!(consumer.metrics().snapshot().consumer.handler_failures, 1);
}

#[tokio::test]
async fn test_failed_handler_retried_under_on_success_policy() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(
        &backend,
        ConsumerConfig {
            ack_policy: AckPolicy::OnSuccess,
            ..consumer_config("event-consumer")
        },
    );
    let store = new_store(&backend);

    let attempts = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&attempts);
    consumer.register_event_handler(
        "OrderPlaced",
        handler_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                let mut attempts = counter.lock();
                *attempts += 1;
                if *attempts == 1 {
                    Err(HandlerError::failed("first attempt fails"))
                } else {
                    Ok(())
                }
            }
        }),
    );

    consumer.init().await;
    place_order(&store, "sku-1").await;
    consumer.poll_events().await;
    assert_eq!(pending(&consumer, &backend).await, 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(consumer.claim_pending_messages().await, 1);

    assert_eq!(*attempts.lock(), 2);
    assert_eq!(pending(&consumer, &backend).await, 0);
}

#[tokio::test]
async fn test_crashed_member_entries_claimed_by_peer() {
    let backend = MemoryStreamBackend::new();
    let crashed = new_consumer(&backend, consumer_config("consumer-a"));
    let survivor = new_consumer(&backend, consumer_config("consumer-b"));
    let store = new_store(&backend);

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
    let event = place_order(&store, "sku-1").await;

    // consumer-a takes delivery and dies before acknowledging.
    let delivered = backend
        .read_group(
            crashed.stream_key(),
            "event-processors",
            "consumer-a",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    assert_eq!(survivor.claim_pending_messages().await, 0);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(survivor.claim_pending_messages().await, 1);

    assert_eq!(rx.try_recv().unwrap(), event.event_id);
    assert_eq!(pending(&survivor, &backend).await, 0);
    assert_eq!(survivor.metrics().snapshot().consumer.records_claimed, 1);
}

#[tokio::test]
async fn test_retrying_entries_do_not_hide_crashed_entries() {
    let backend = MemoryStreamBackend::new();
    let config = ConsumerConfig {
        ack_policy: AckPolicy::OnSuccess,
        max_batch_size: 2,
        ..consumer_config("consumer-b")
    };
    let survivor = new_consumer(&backend, config);
    let store = new_store(&backend);

    let (tx, mut rx) = mpsc::unbounded_channel();
    survivor.register_event_handler(
        "OrderPlaced",
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let poisoned = event
                    .payload::<OrderPlaced>()
                    .is_some_and(|order| order.sku == "poison");
                if poisoned {
                    return Err(HandlerError::failed("cannot process order"));
                }
                let _ = tx.send(event.event_id);
                Ok(())
            }
        }),
    );

    survivor.init().await;
    for _ in 0..3 {
        place_order(&store, "poison").await;
    }
    survivor.poll_events().await;
    survivor.poll_events().await;
    assert_eq!(pending(&survivor, &backend).await, 3);

    // consumer-a takes delivery of a good order and dies before acknowledging.
    let event = place_order(&store, "sku-1").await;
    let delivered = backend
        .read_group(
            survivor.stream_key(),
            "event-processors",
            "consumer-a",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    // The oldest two poison entries fill the first batch and fail again.
    assert_eq!(survivor.claim_pending_messages().await, 2);
    assert!(rx.try_recv().is_err());

    // Their idle time was reset, so the next batch reaches past them.
    assert_eq!(survivor.claim_pending_messages().await, 2);
    assert_eq!(rx.try_recv().unwrap(), event.event_id);
    assert_eq!(pending(&survivor, &backend).await, 3);
}

#[tokio::test]
async fn test_observer_group_does_not_take_group_entries() {
    let backend = MemoryStreamBackend::new();
    let config = consumer_config("event-consumer");
    let processor = new_consumer(&backend, config.clone());
    let observer = new_consumer(&backend, config.observer());
    let store = new_store(&backend);

    let (tx, mut rx) = mpsc::unbounded_channel();
    processor.register_all_events_handler(handler_fn(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event.event_id);
            Ok(())
        }
    }));
    let seen = Arc::new(Mutex::new(Vec::new()));
    observer.register_all_events_handler(recording(&seen, "observer"));

    processor.init().await;
    observer.init().await;
    let event = place_order(&store, "sku-1").await;

    observer.poll_events().await;
    assert_eq!(*seen.lock(), vec!["observer"]);
    assert_eq!(pending(&observer, &backend).await, 0);
    assert_eq!(pending(&processor, &backend).await, 0);

    processor.poll_events().await;
    assert_eq!(rx.try_recv().unwrap(), event.event_id);
    assert_eq!(pending(&processor, &backend).await, 0);
}

#[tokio::test]
async fn test_unregistered_handler_not_invoked() {
    let backend = MemoryStreamBackend::new();
    let consumer = new_consumer(&backend, consumer_config("event-consumer"));
    let store = new_store(&backend);
    let log = Arc::new(Mutex::new(Vec::new()));

    let typed = consumer.register_event_handler("OrderPlaced", recording(&log, "placed"));
    let all = consumer.register_all_events_handler(recording(&log, "all"));
    assert!(consumer.unregister_event_handler("OrderPlaced", typed));
    assert!(consumer.unregister_all_events_handler(all));
    assert!(!consumer.unregister_all_events_handler(all));

    consumer.init().await;
    place_order(&store, "sku-1").await;
    consumer.poll_events().await;

    assert!(log.lock().is_empty());
    assert_eq!(pending(&consumer, &backend).await, 0);
}

#[tokio::test]
async fn test_start_and_shutdown() {
    let backend = MemoryStreamBackend::new();
    let consumer = Arc::new(new_consumer(&backend, consumer_config("event-consumer")));
    let store = new_store(&backend);

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer.register_event_handler(
        "OrderPlaced",
        handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.event_id);
                Ok(())
            }
        }),
    );

    consumer.init().await;
    let task = consumer.start().unwrap();
    assert!(consumer.is_running());
    assert!(consumer.start().is_none());

    let event = place_order(&store, "sku-1").await;
    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, event.event_id);

    consumer.shutdown();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(!consumer.is_running());
}
