//! Event handlers and dispatch.
//!
//! Handlers are invoked by push subscriptions and by the group consumer.
//! Failures, including panics, are contained per handler: they are logged
//! and reported to the caller, never propagated into other handlers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::error;

use crate::codec::Event;
use crate::config::AckPolicy;

/// Result type returned by handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Failure reported by an event handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handler for processing events delivered from a stream.
pub trait EventHandler: Send + Sync {
    /// Process one event.
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, HandlerResult>;
}

/// Adapts a closure returning a future into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, HandlerResult> {
        (self.0)(event).boxed()
    }
}

/// Build a shared handler from an async closure.
///
/// ```ignore
/// let handler = handler_fn(|event| async move {
///     println!("{}", event.event_type);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one handler, converting a panic into [`HandlerError::Panicked`].
pub async fn invoke(handler: &dyn EventHandler, event: Arc<Event>) -> HandlerResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
        Ok(future) => future,
        Err(payload) => return Err(HandlerError::Panicked(panic_message(payload))),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload))),
    }
}

/// Dispatch an event to handlers in order.
///
/// Calls each handler in sequence, logging errors but continuing to subsequent
/// handlers. Returns the number of handlers that failed.
pub async fn dispatch_to_handlers(handlers: &[Arc<dyn EventHandler>], event: &Arc<Event>) -> usize {
    let mut failures = 0;
    for handler in handlers {
        if let Err(e) = invoke(handler.as_ref(), Arc::clone(event)).await {
            error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                "Handler failed"
            );
            failures += 1;
        }
    }
    failures
}

/// Result of processing one stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// All handlers succeeded.
    Success,
    /// One or more handlers failed.
    HandlerFailed,
    /// Entry is malformed, no retry will help.
    DecodeError,
    /// Entry names an event type this consumer's codec does not know. A
    /// group member that registered the type can still claim it.
    UnknownEventType,
    /// Sentinel placeholder, nothing to dispatch.
    Sentinel,
}

impl DispatchResult {
    /// Returns true if the entry should be acknowledged under `policy`.
    ///
    /// Malformed entries and sentinels are always acked, since no
    /// redelivery can process them. Unknown event types never are.
    pub fn should_ack(&self, policy: AckPolicy) -> bool {
        match self {
            Self::Success | Self::DecodeError | Self::Sentinel => true,
            Self::HandlerFailed => policy == AckPolicy::Always,
            Self::UnknownEventType => false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
