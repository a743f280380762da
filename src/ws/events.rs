use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::message::{Event, EventKind};

/// Callback invoked for every event of the kind it was registered for.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identity of one registration, used to remove exactly that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Ordered handler lists keyed by event kind.
///
/// Handlers run in registration order. Registering the same closure twice yields two
/// independent registrations, each invoked once per event.
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&EventKind, usize> =
            handlers.iter().map(|(kind, list)| (kind, list.len())).collect();
        f.debug_struct("EventRegistry")
            .field("handlers", &counts)
            .finish_non_exhaustive()
    }
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // A poisoned lock only means a writer panicked; the handler lists are still consistent.
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one registration. Returns whether it was present.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the event's kind, in registration order.
    ///
    /// The handler list is snapshotted first, so handlers may register or remove handlers
    /// while running. A panicking handler is logged and skipped; the remaining handlers still
    /// run. Returns the number of handlers that completed normally.
    pub fn emit(&self, event: &Event) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(HandlerId, Handler)> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut completed = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    #[cfg(feature = "tracing")]
                    tracing::error!(%kind, ?id, %reason, "event handler panicked");
                    #[cfg(not(feature = "tracing"))]
                    let _ = (&id, &reason);
                }
            }
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_factory = Arc::clone(&seen);
        let factory = move |label: &'static str| -> Handler {
            let seen = Arc::clone(&seen_for_factory);
            Arc::new(move |_event: &Event| seen.lock().unwrap().push(label.to_owned()))
        };
        (seen, factory)
    }

    #[test]
    fn handlers_run_in_registration_order_including_duplicates() {
        let registry = EventRegistry::new();
        let (seen, handler) = recorder();

        let first = handler("first");
        let second = handler("second");
        registry.on(EventKind::TickData, {
            let first = Arc::clone(&first);
            move |e| first(e)
        });
        registry.on(EventKind::TickData, move |e| second(e));
        registry.on(EventKind::TickData, move |e| first(e));

        let completed = registry.emit(&Event::TickData(json!({})));

        assert_eq!(completed, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "first"]);
    }

    #[test]
    fn off_removes_only_that_registration() {
        let registry = EventRegistry::new();
        let (seen, handler) = recorder();

        let a = handler("a");
        let b = handler("b");
        let id_a = registry.on(EventKind::PortfolioUpdate, move |e| a(e));
        registry.on(EventKind::PortfolioUpdate, move |e| b(e));

        assert!(registry.off(EventKind::PortfolioUpdate, id_a), "registration should exist");
        assert!(!registry.off(EventKind::PortfolioUpdate, id_a), "second removal is a no-op");
        assert!(!registry.off(EventKind::TickData, id_a), "kind must match");

        registry.emit(&Event::PortfolioUpdate(json!({})));
        assert_eq!(*seen.lock().unwrap(), vec!["b"]);
        assert_eq!(registry.handler_count(EventKind::PortfolioUpdate), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_later_handlers() {
        let registry = EventRegistry::new();
        let (seen, handler) = recorder();

        registry.on(EventKind::TickData, |_| panic!("handler failure"));
        let after = handler("after");
        registry.on(EventKind::TickData, move |e| after(e));

        let completed = registry.emit(&Event::TickData(json!({})));

        assert_eq!(completed, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["after"]);

        // The registry is still usable afterwards
        assert_eq!(registry.emit(&Event::TickData(json!({}))), 1);
    }

    #[test]
    fn handlers_may_unregister_themselves_while_running() {
        let registry = Arc::new(EventRegistry::new());
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));

        let id = registry.on(EventKind::Message, {
            let registry = Arc::clone(&registry);
            let slot = Arc::clone(&slot);
            move |_| {
                if let Some(id) = *slot.lock().unwrap() {
                    registry.off(EventKind::Message, id);
                }
            }
        });
        *slot.lock().unwrap() = Some(id);

        let event = Event::Message(crate::ws::message::InboundMessage::new("x", None));
        assert_eq!(registry.emit(&event), 1);
        assert_eq!(registry.emit(&event), 0);
    }
}
