//! Shared storage integration tests.
//!
//! Exercises the event store, subscriptions and consumer groups against
//! every stream backend. Each backend module imports these test functions
//! and runs them.

pub mod event_store_tests;
