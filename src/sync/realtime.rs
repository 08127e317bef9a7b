//! Realtime bridge.
//!
//! Turns server-pushed row-change notifications for one table into
//! `DataChanged` events on the invalidation bus. Reconnection belongs to the
//! transport; the bridge only follows the status it reports.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::bus::InvalidationBus;
use super::events::InvalidationEvent;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use crate::domain::{RowOperation, Table};

const SOURCE: &str = "sync::realtime";

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime transport is closed")]
    Closed,
    #[error("failed to subscribe to channel `{channel}`: {reason}")]
    Subscribe { channel: String, reason: String },
    #[error("realtime connection failed: {0}")]
    Connection(String),
}

/// Identifier of a channel registered with a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel#{}", self.0)
    }
}

/// What to listen for on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub schema: String,
    pub table: String,
    /// Optional row filter in the backend's `column=eq.value` syntax.
    pub filter: Option<String>,
}

impl ChannelSpec {
    pub fn for_table(table: Table) -> Self {
        Self {
            name: format!("{}-changes", table.as_str()),
            schema: "public".to_string(),
            table: table.as_str().to_string(),
            filter: None,
        }
    }
}

/// One row change pushed by the server.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub operation: RowOperation,
    pub record: Value,
}

/// Status reported by the transport for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
}

pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// The channel surface of the realtime backend.
///
/// `subscribe` registers callbacks and returns at once; the status callback
/// reports `Subscribed` when the server confirms, and may report it again
/// after the transport reconnects on its own.
pub trait RealtimeTransport: Send + Sync {
    fn subscribe(
        &self,
        spec: ChannelSpec,
        on_change: ChangeCallback,
        on_status: StatusCallback,
    ) -> Result<ChannelId, RealtimeError>;

    fn remove_channel(&self, channel: ChannelId);
}

/// Connection state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Forwards one table's row changes onto the invalidation bus.
pub struct RealtimeBridge {
    transport: Arc<dyn RealtimeTransport>,
    bus: InvalidationBus,
    table: Table,
    prefixes: Vec<CacheKey>,
    state: Arc<Mutex<BridgeState>>,
    channel: Mutex<Option<ChannelId>>,
}

impl RealtimeBridge {
    /// `prefixes` are the cache keys refreshed when the table changes.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        bus: InvalidationBus,
        table: Table,
        prefixes: Vec<CacheKey>,
    ) -> Self {
        Self {
            transport,
            bus,
            table,
            prefixes,
            state: Arc::new(Mutex::new(BridgeState::Disconnected)),
            channel: Mutex::new(None),
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn state(&self) -> BridgeState {
        *mutex_lock(&self.state, SOURCE, "state")
    }

    pub fn is_connected(&self) -> bool {
        mutex_lock(&self.channel, SOURCE, "is_connected").is_some()
    }

    /// Open the channel. A bridge that already holds a channel is left as is.
    pub fn connect(&self) -> Result<(), RealtimeError> {
        let mut channel = mutex_lock(&self.channel, SOURCE, "connect");
        if channel.is_some() {
            return Ok(());
        }
        *mutex_lock(&self.state, SOURCE, "connect") = BridgeState::Connecting;

        let on_change = self.change_callback();
        let on_status = self.status_callback();
        match self
            .transport
            .subscribe(ChannelSpec::for_table(self.table), on_change, on_status)
        {
            Ok(id) => {
                debug!(table = %self.table, channel = %id, "Realtime channel opened");
                *channel = Some(id);
                Ok(())
            }
            Err(err) => {
                *mutex_lock(&self.state, SOURCE, "connect") = BridgeState::Disconnected;
                Err(err)
            }
        }
    }

    /// Remove the channel. Safe to call any number of times; the transport
    /// sees exactly one removal per successful `connect`.
    pub fn disconnect(&self) {
        let taken = mutex_lock(&self.channel, SOURCE, "disconnect").take();
        if let Some(id) = taken {
            self.transport.remove_channel(id);
            debug!(table = %self.table, channel = %id, "Realtime channel removed");
        }
        *mutex_lock(&self.state, SOURCE, "disconnect") = BridgeState::Disconnected;
    }

    fn change_callback(&self) -> ChangeCallback {
        let bus = self.bus.clone();
        let state = self.state.clone();
        let prefixes = self.prefixes.clone();
        let table = self.table;
        Arc::new(move |change: ChangeEvent| {
            if *mutex_lock(&state, SOURCE, "on_change") != BridgeState::Subscribed {
                debug!(table = %table, "Change ignored: channel not subscribed");
                return;
            }
            debug!(
                table = %table,
                operation = change.operation.as_str(),
                "Realtime change received"
            );
            bus.publish(InvalidationEvent::data_changed(
                prefixes.clone(),
                table.as_str(),
            ));
        })
    }

    fn status_callback(&self) -> StatusCallback {
        let state = self.state.clone();
        let table = self.table;
        Arc::new(move |status: ChannelStatus| {
            let next = match status {
                ChannelStatus::Subscribed => {
                    info!(table = %table, "Realtime channel subscribed");
                    BridgeState::Subscribed
                }
                ChannelStatus::Closed => {
                    debug!(table = %table, "Realtime channel closed");
                    BridgeState::Disconnected
                }
                ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
                    warn!(table = %table, status = ?status, "Realtime channel lost");
                    BridgeState::Disconnected
                }
            };
            *mutex_lock(&state, SOURCE, "on_status") = next;
        })
    }
}

impl Drop for RealtimeBridge {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::infra::realtime::MemoryRealtime;
    use crate::sync::bus::BusSubscription;
    use crate::sync::events::EventKind;

    fn bridge(transport: &Arc<MemoryRealtime>, bus: &InvalidationBus) -> RealtimeBridge {
        RealtimeBridge::new(
            transport.clone(),
            bus.clone(),
            Table::SewerQualityData,
            vec![CacheKey::root("sewerData")],
        )
    }

    type Recorded = Arc<Mutex<Vec<InvalidationEvent>>>;

    fn recorder(bus: &InvalidationBus) -> (Recorded, BusSubscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = bus.subscribe("recorder", move |event| {
            sink.lock().expect("lock").push(event.clone());
            Ok(())
        });
        (seen, subscription)
    }

    #[test]
    fn state_follows_transport_status() {
        let transport = Arc::new(MemoryRealtime::new());
        let bus = InvalidationBus::new();
        let bridge = bridge(&transport, &bus);
        assert_eq!(bridge.state(), BridgeState::Disconnected);

        bridge.connect().expect("connect");
        assert_eq!(bridge.state(), BridgeState::Connecting);

        transport.emit_status("sewer_quality_data", ChannelStatus::Subscribed);
        assert_eq!(bridge.state(), BridgeState::Subscribed);

        transport.emit_status("sewer_quality_data", ChannelStatus::ChannelError);
        assert_eq!(bridge.state(), BridgeState::Disconnected);

        transport.emit_status("sewer_quality_data", ChannelStatus::Subscribed);
        assert_eq!(bridge.state(), BridgeState::Subscribed);
    }

    #[test]
    fn change_publishes_data_changed() {
        let transport = Arc::new(MemoryRealtime::new());
        let bus = InvalidationBus::new();
        let (seen, _subscription) = recorder(&bus);
        let bridge = bridge(&transport, &bus);
        bridge.connect().expect("connect");
        transport.emit_status("sewer_quality_data", ChannelStatus::Subscribed);

        transport.emit_change("sewer_quality_data", RowOperation::Delete, json!({"id": 7}));

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, EventKind::DataChanged);
        assert!(seen[0].notify_user);
        assert_eq!(seen[0].source_label, "sewer_quality_data");
        assert_eq!(seen[0].targets, vec![CacheKey::root("sewerData")]);
    }

    #[test]
    fn changes_while_disconnected_are_dropped() {
        let transport = Arc::new(MemoryRealtime::new());
        let bus = InvalidationBus::new();
        let (seen, _subscription) = recorder(&bus);
        let bridge = bridge(&transport, &bus);
        bridge.connect().expect("connect");

        transport.emit_change("sewer_quality_data", RowOperation::Insert, json!({}));
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn disconnect_removes_channel_once() {
        let transport = Arc::new(MemoryRealtime::new());
        let bus = InvalidationBus::new();
        let bridge = bridge(&transport, &bus);

        bridge.connect().expect("connect");
        bridge.connect().expect("second connect is a no-op");
        assert_eq!(transport.active_channels(), 1);

        bridge.disconnect();
        bridge.disconnect();
        drop(bridge);
        assert_eq!(transport.active_channels(), 0);
        assert_eq!(transport.removals(), 1);
    }
}
