//! eventlog - event-sourcing storage over append-only streams
//!
//! Per-aggregate streams with optimistic concurrency, a global stream of
//! every event, push subscriptions and consumer groups with crash
//! recovery. Streams live in Redis or, for tests and embedding, in memory.

pub mod codec;
pub mod config;
pub mod consumer;
pub mod handler;
pub mod metrics;
pub mod storage;
pub mod store;
pub mod utils;

pub use codec::{DomainEvent, Event, EventCodec, RawEvent};
pub use consumer::{EventConsumer, HandlerId};
pub use handler::{handler_fn, EventHandler, HandlerError, HandlerResult};
pub use metrics::EventStoreMetrics;
pub use storage::{init_backend, StreamBackend};
pub use store::{EventStore, StoreError, Subscription};
