//! User-facing change notifications.
//!
//! Listens on the bus and turns `DataChanged` events into short-lived
//! toasts. Silent invalidations (poll ticks) never produce one. An admin
//! write is usually echoed back by the realtime channel moments later; the
//! identical toast for the echo is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::bus::{BusSubscription, InvalidationBus};
use super::events::{EventKind, InvalidationEvent};
use super::lock::mutex_lock;
use crate::domain::Table;

const SOURCE: &str = "sync::notify";
const DEFAULT_TTL_MS: u64 = 3_000;
const ERROR_TTL_MS: u64 = 5_000;
const CHANNEL_CAPACITY: usize = 64;
const DUPLICATE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub id: Uuid,
    pub kind: ToastKind,
    pub text: String,
    pub ttl_ms: u64,
}

impl Toast {
    fn info(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ToastKind::Info,
            text,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }

    fn error(text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ToastKind::Error,
            text,
            ttl_ms: ERROR_TTL_MS,
        }
    }
}

/// Broadcasts toasts to any number of UI receivers.
pub struct Notifier {
    tx: broadcast::Sender<Toast>,
    recent: Arc<Mutex<HashMap<String, Instant>>>,
    subscription: Mutex<Option<BusSubscription>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            recent: Arc::new(Mutex::new(HashMap::new())),
            subscription: Mutex::new(None),
        }
    }

    /// Start turning `DataChanged` events on `bus` into toasts.
    pub fn attach(&self, bus: &InvalidationBus) {
        let tx = self.tx.clone();
        let recent = self.recent.clone();
        let subscription = bus.subscribe("notifier", move |event| {
            if let Some(toast) = toast_for(event) {
                if is_repeat(&recent, &toast.text, Instant::now()) {
                    debug!(event_id = %event.id, text = %toast.text, "Repeated toast dropped");
                    return Ok(());
                }
                debug!(event_id = %event.id, text = %toast.text, "Toast raised");
                // No receivers is fine; nobody is looking.
                let _ = tx.send(toast);
            }
            Ok(())
        });
        *mutex_lock(&self.subscription, SOURCE, "attach") = Some(subscription);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Toast> {
        self.tx.subscribe()
    }

    /// Report a failure to the view that initiated it.
    pub fn error(&self, text: impl Into<String>) {
        let _ = self.tx.send(Toast::error(text.into()));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Records `text` and reports whether it was already raised within the
/// duplicate window.
fn is_repeat(recent: &Mutex<HashMap<String, Instant>>, text: &str, now: Instant) -> bool {
    let mut recent = mutex_lock(recent, SOURCE, "is_repeat");
    recent.retain(|_, raised| now.saturating_duration_since(*raised) < DUPLICATE_WINDOW);
    if recent.contains_key(text) {
        return true;
    }
    recent.insert(text.to_string(), now);
    false
}

fn toast_for(event: &InvalidationEvent) -> Option<Toast> {
    if event.kind != EventKind::DataChanged || !event.notify_user {
        return None;
    }
    let dataset = event
        .source_label
        .parse::<Table>()
        .map(Table::display_name)
        .unwrap_or(event.source_label.as_str());
    Some(Toast::info(format!("{dataset} updated")))
}
