//! Invalidation bus.
//!
//! Decouples publishers (mutation handlers, realtime bridges, poll timers)
//! from listeners (the query client, the notifier). One bus is constructed
//! at startup and handed to every component that needs it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::events::{Epoch, EventKind, InvalidationEvent};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "sync::bus";
const METRIC_INVALIDATION_TOTAL: &str = "aquasync_invalidation_total";
const METRIC_HANDLER_FAILURE_TOTAL: &str = "aquasync_bus_handler_failure_total";

/// Failure reported by a listener. Logged and counted, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type Handler = Arc<dyn Fn(&InvalidationEvent) -> Result<(), HandlerError> + Send + Sync>;

struct Listener {
    id: u64,
    name: String,
    handler: Handler,
}

struct BusInner {
    listeners: RwLock<Vec<Listener>>,
    next_listener_id: AtomicU64,
    epoch_counter: AtomicU64,
}

/// Result of one `publish` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub epoch: Epoch,
    pub delivered: usize,
    pub failed: usize,
}

/// Process-wide publish/subscribe channel for invalidation events.
#[derive(Clone)]
pub struct InvalidationBus {
    inner: Arc<BusInner>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                epoch_counter: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener. Delivery follows registration order.
    ///
    /// The listener stays registered until the returned subscription is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, name: impl Into<String>, handler: F) -> BusSubscription
    where
        F: Fn(&InvalidationEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let name = name.into();
        debug!(listener_id = id, listener = %name, "Bus listener registered");
        rw_write(&self.inner.listeners, SOURCE, "subscribe").push(Listener {
            id,
            name,
            handler: Arc::new(handler),
        });

        BusSubscription {
            bus: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Deliver `event` synchronously to every current listener.
    ///
    /// Never fails: a listener that returns an error or panics is logged and
    /// skipped, and delivery continues with the next one.
    pub fn publish(&self, mut event: InvalidationEvent) -> PublishOutcome {
        event.epoch = self.inner.epoch_counter.fetch_add(1, Ordering::SeqCst);

        match event.kind {
            EventKind::Invalidate => debug!(
                event_id = %event.id,
                event_epoch = event.epoch,
                event = %event,
                "Invalidation published"
            ),
            EventKind::DataChanged => info!(
                event_id = %event.id,
                event_epoch = event.epoch,
                event = %event,
                "Data change published"
            ),
        }
        counter!(METRIC_INVALIDATION_TOTAL, "kind" => event.kind.as_str()).increment(1);

        // Snapshot so listeners may subscribe, unsubscribe or publish re-entrantly.
        let snapshot: Vec<(u64, String, Handler)> =
            rw_read(&self.inner.listeners, SOURCE, "publish")
                .iter()
                .map(|listener| (listener.id, listener.name.clone(), listener.handler.clone()))
                .collect();

        let mut outcome = PublishOutcome {
            epoch: event.epoch,
            delivered: 0,
            failed: 0,
        };

        for (id, name, handler) in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            match failure {
                None => outcome.delivered += 1,
                Some(reason) => {
                    outcome.failed += 1;
                    counter!(METRIC_HANDLER_FAILURE_TOTAL).increment(1);
                    warn!(
                        listener_id = id,
                        listener = %name,
                        event_id = %event.id,
                        event_epoch = event.epoch,
                        reason = %reason,
                        "Invalidation listener failed"
                    );
                }
            }
        }

        outcome
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        rw_read(&self.inner.listeners, SOURCE, "listener_count").len()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration handle returned by [`InvalidationBus::subscribe`].
pub struct BusSubscription {
    bus: Weak<BusInner>,
    id: Option<u64>,
}

impl BusSubscription {
    /// Remove the listener. Calling this more than once has no effect.
    pub fn unsubscribe(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(bus) = self.bus.upgrade() {
            rw_write(&bus.listeners, SOURCE, "unsubscribe").retain(|listener| listener.id != id);
            debug!(listener_id = id, "Bus listener removed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("listener panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("listener panicked: {message}")
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sync::keys::CacheKey;

    fn event() -> InvalidationEvent {
        InvalidationEvent::invalidate(CacheKey::root("sewerData"), "test")
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = InvalidationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        let _a = bus.subscribe("first", move |_| {
            first.lock().expect("lock").push("first");
            Ok(())
        });
        let second = seen.clone();
        let _b = bus.subscribe("second", move |_| {
            second.lock().expect("lock").push("second");
            Ok(())
        });

        let outcome = bus.publish(event());
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(*seen.lock().expect("lock"), vec!["first", "second"]);
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let bus = InvalidationBus::new();
        let reached = Arc::new(Mutex::new(0_u32));

        let _err = bus.subscribe("errors", |_| Err(HandlerError::new("boom")));
        let _panic = bus.subscribe("panics", |_| panic!("listener exploded"));
        let counter = reached.clone();
        let _ok = bus.subscribe("counts", move |_| {
            *counter.lock().expect("lock") += 1;
            Ok(())
        });

        let outcome = bus.publish(event());
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(*reached.lock().expect("lock"), 1);
    }

    #[test]
    fn epochs_increase_per_publish() {
        let bus = InvalidationBus::new();
        let first = bus.publish(event());
        let second = bus.publish(event());
        assert!(first.epoch < second.epoch);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let bus = InvalidationBus::new();
        let subscription = bus.subscribe("temp", |_| Ok(()));
        assert_eq!(bus.listener_count(), 1);

        drop(subscription);
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.publish(event()).delivered, 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = InvalidationBus::new();
        let _keep = bus.subscribe("keep", |_| Ok(()));
        let mut subscription = bus.subscribe("temp", |_| Ok(()));

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn listener_may_publish_reentrantly() {
        let bus = InvalidationBus::new();
        let inner_bus = bus.clone();
        let hits = Arc::new(Mutex::new(0_u32));
        let counter = hits.clone();

        let _listener = bus.subscribe("relay", move |event| {
            *counter.lock().expect("lock") += 1;
            if event.source_label == "outer" {
                inner_bus.publish(InvalidationEvent::invalidate(
                    CacheKey::root("x"),
                    "inner",
                ));
            }
            Ok(())
        });

        bus.publish(InvalidationEvent::invalidate(CacheKey::root("x"), "outer"));
        assert_eq!(*hits.lock().expect("lock"), 2);
    }
}
