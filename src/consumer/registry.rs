//! Handler registry for group consumers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::handler::EventHandler;

/// Identity of a registration, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Registered = (HandlerId, Arc<dyn EventHandler>);

/// Per-type and catch-all handler lists.
///
/// Dispatch works on a cloned snapshot, so registrations may change while
/// a record is being handled.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    by_type: RwLock<HashMap<String, Vec<Registered>>>,
    catch_all: RwLock<Vec<Registered>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = self.next_id();
        self.by_type
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        debug!(event_type = %event_type, handler_id = id.0, "Registered handler");
        id
    }

    pub fn register_all(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = self.next_id();
        self.catch_all.write().push((id, handler));
        debug!(handler_id = id.0, "Registered handler for all events");
        id
    }

    /// Remove a per-type handler. Returns false if it was not registered.
    pub fn unregister(&self, event_type: &str, id: HandlerId) -> bool {
        let mut by_type = self.by_type.write();
        let Some(handlers) = by_type.get_mut(event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            by_type.remove(event_type);
        }
        if removed {
            debug!(event_type = %event_type, handler_id = id.0, "Unregistered handler");
        }
        removed
    }

    /// Remove a catch-all handler. Returns false if it was not registered.
    pub fn unregister_all(&self, id: HandlerId) -> bool {
        let mut catch_all = self.catch_all.write();
        let before = catch_all.len();
        catch_all.retain(|(registered, _)| *registered != id);
        let removed = catch_all.len() != before;
        if removed {
            debug!(handler_id = id.0, "Unregistered handler for all events");
        }
        removed
    }

    /// Handlers for `event_type` in dispatch order: per-type handlers in
    /// registration order, then catch-all handlers.
    pub fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut handlers: Vec<Arc<dyn EventHandler>> = self
            .by_type
            .read()
            .get(event_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        handlers.extend(self.catch_all.read().iter().map(|(_, h)| Arc::clone(h)));
        handlers
    }
}
