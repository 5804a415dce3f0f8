//! eventlog-tail: log every event of the global stream
//!
//! Reads through a private consumer group derived from the configured one,
//! so the group's real members keep every entry. The private group is
//! removed again on exit. Useful for watching event flow during development.
//!
//! ## Configuration
//! - EVENTLOG_CONFIG: path to a YAML config file (optional)
//! - EVENTLOG__STORAGE__REDIS__HOST etc.: per-field overrides
//! - EVENTLOG_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::{info, warn};

use eventlog::config::Config;
use eventlog::utils::bootstrap::init_tracing;
use eventlog::{
    handler_fn, init_backend, EventCodec, EventConsumer, EventStoreMetrics, StreamBackend,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let backend = init_backend(&config.storage).await?;
    let metrics = Arc::new(EventStoreMetrics::new());
    let observer = config.consumer.observer();

    let consumer = Arc::new(
        EventConsumer::new(
            Arc::clone(&backend),
            Arc::new(EventCodec::lenient()),
            &config.streams,
            observer.clone(),
        )
        .with_metrics(Arc::clone(&metrics)),
    );

    consumer.register_all_events_handler(handler_fn(|event| async move {
        let data = event.payload_json().unwrap_or_default();
        info!(
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            version = event.version,
            event_id = %event.event_id,
            timestamp = %event.timestamp,
            data = %data,
            "Event"
        );
        Ok(())
    }));

    consumer.init().await;
    let task = consumer.start();

    info!(
        stream = %consumer.stream_key(),
        group = %observer.consumer_group,
        consumer = %observer.consumer_name,
        "eventlog-tail started"
    );

    tokio::signal::ctrl_c().await?;
    consumer.shutdown();
    if let Some(task) = task {
        task.await?;
    }

    if let Err(e) = backend
        .destroy_group(consumer.stream_key(), &observer.consumer_group)
        .await
    {
        warn!(group = %observer.consumer_group, error = %e, "Failed to remove tail group");
    }

    info!(metrics = %metrics.snapshot(), "eventlog-tail stopped");
    Ok(())
}
