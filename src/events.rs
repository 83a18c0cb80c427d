// warp_client/src/events.rs
// Named-event callback registry with ordered, isolated dispatch

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error};

use crate::shutdown;

/// A registered event callback. Invoked synchronously with the event payload.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Result of a single `emit` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Callbacks that ran (including those that panicked).
    pub invoked: usize,
    /// Callbacks that panicked while running.
    pub failed: usize,
}

struct RegistryInner {
    callbacks: HashMap<String, Vec<Callback>>,
    closed: bool,
}

/// Mapping from event name to an ordered list of subscribers.
///
/// Registration is the only mutation path; the lists are never exposed
/// directly. Insertion order is invocation order and duplicates are allowed.
/// Once closed (session teardown), registrations become silent no-ops and
/// emissions are dropped.
pub struct EventRegistry {
    inner: Mutex<RegistryInner>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                callbacks: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a callback for an event. Returns false (and registers
    /// nothing) if the registry has been closed.
    pub fn register(&self, event: &str, callback: Callback) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.closed {
            debug!(%event, "callback registration ignored, registry closed");
            return false;
        }
        inner
            .callbacks
            .entry(event.to_string())
            .or_default()
            .push(callback);
        true
    }

    /// Close the registry. Further registrations are ignored and further
    /// emissions are dropped. Idempotent.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }

    /// Deliver `data` to every callback registered for `event`, in
    /// registration order.
    ///
    /// Dropped without error when the process is shutting down or the
    /// registry is closed. A panicking callback is caught and logged;
    /// delivery continues with the remaining callbacks.
    pub fn emit(&self, event: &str, data: &Value) -> DispatchOutcome {
        if shutdown::in_progress() {
            return DispatchOutcome::default();
        }

        // Snapshot the list so callbacks may register without deadlocking.
        let targets: Vec<Callback> = {
            let Ok(inner) = self.inner.lock() else {
                return DispatchOutcome::default();
            };
            if inner.closed {
                return DispatchOutcome::default();
            }
            match inner.callbacks.get(event) {
                Some(list) => list.clone(),
                None => return DispatchOutcome::default(),
            }
        };

        let mut outcome = DispatchOutcome::default();
        for callback in targets {
            outcome.invoked += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(data))) {
                outcome.failed += 1;
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                // Best-effort only; a failing callback never aborts delivery.
                error!(%event, %reason, "event callback failed");
            }
        }
        outcome
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(log: &Arc<Mutex<Vec<usize>>>, id: usize) -> Callback {
        let log = Arc::clone(log);
        Arc::new(move |_data| {
            log.lock().unwrap().push(id);
        })
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..5 {
            registry.register("tick", recorder(&log, id));
        }

        let outcome = registry.emit("tick", &json!({}));
        assert_eq!(outcome.invoked, 5);
        assert_eq!(outcome.failed, 0);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_duplicate_callbacks_each_fire_once() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let cb = recorder(&log, 7);

        registry.register("tick", Arc::clone(&cb));
        registry.register("tick", cb);

        registry.emit("tick", &json!(null));
        assert_eq!(*log.lock().unwrap(), vec![7, 7]);
    }

    #[test]
    fn test_emit_unknown_event_is_noop() {
        let registry = EventRegistry::new();
        let outcome = registry.emit("nobody_home", &json!({}));
        assert_eq!(outcome, DispatchOutcome::default());
    }

    #[test]
    fn test_panicking_callback_does_not_block_later_callbacks() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("boom", recorder(&log, 1));
        registry.register(
            "boom",
            Arc::new(|_data| panic!("callback exploded")),
        );
        registry.register("boom", recorder(&log, 3));

        let outcome = registry.emit("boom", &json!({}));
        assert_eq!(outcome.invoked, 3);
        assert_eq!(outcome.failed, 1);
        assert_eq!(*log.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_closed_registry_ignores_registration_and_emit() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("tick", recorder(&log, 1));
        registry.close();
        assert!(registry.is_closed());

        // Late registration must be silently ignored.
        assert!(!registry.register("tick", recorder(&log, 2)));

        let outcome = registry.emit("tick", &json!({}));
        assert_eq!(outcome.invoked, 0);
        assert!(log.lock().unwrap().is_empty());

        // close is idempotent
        registry.close();
        assert!(registry.is_closed());
    }

    #[test]
    fn test_events_are_independent() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.register("a", recorder(&log, 1));
        registry.register("b", recorder(&log, 2));

        registry.emit("b", &json!({}));
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_callback_receives_payload() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        registry.register(
            "payload",
            Arc::new(move |data| {
                *seen_clone.lock().unwrap() = Some(data.clone());
            }),
        );

        registry.emit("payload", &json!({"type": "payload", "n": 42}));
        let got = seen.lock().unwrap().clone().unwrap();
        assert_eq!(got["n"], 42);
    }
}
