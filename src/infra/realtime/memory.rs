use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::domain::RowOperation;
use crate::sync::lock::mutex_lock;
use crate::sync::{
    ChangeCallback, ChangeEvent, ChannelId, ChannelSpec, ChannelStatus, RealtimeError,
    RealtimeTransport, StatusCallback,
};

const SOURCE: &str = "infra::realtime::memory";

struct Channel {
    spec: ChannelSpec,
    on_change: ChangeCallback,
    on_status: StatusCallback,
}

#[derive(Default)]
struct State {
    channels: HashMap<ChannelId, Channel>,
    next_id: u64,
    subscriptions: usize,
    removals: usize,
    closed: bool,
}

/// In-process realtime transport.
#[derive(Default)]
pub struct MemoryRealtime {
    state: Mutex<State>,
    auto_subscribe: bool,
}

impl MemoryRealtime {
    /// Channels stay unconfirmed until `emit_status` reports otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Channels are confirmed as soon as they are subscribed.
    pub fn auto_subscribing() -> Self {
        Self {
            auto_subscribe: true,
            ..Self::default()
        }
    }

    /// Push a row change to every channel watching `table`.
    pub fn emit_change(&self, table: &str, operation: RowOperation, record: Value) {
        for callback in self.matching(table, |channel| channel.on_change.clone()) {
            callback(ChangeEvent {
                table: table.to_string(),
                operation,
                record: record.clone(),
            });
        }
    }

    /// Report `status` on every channel watching `table`.
    pub fn emit_status(&self, table: &str, status: ChannelStatus) {
        for callback in self.matching(table, |channel| channel.on_status.clone()) {
            callback(status);
        }
    }

    /// Refuse every later `subscribe`.
    pub fn close(&self) {
        mutex_lock(&self.state, SOURCE, "close").closed = true;
    }

    pub fn active_channels(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "active_channels")
            .channels
            .len()
    }

    pub fn subscriptions(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "subscriptions").subscriptions
    }

    pub fn removals(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "removals").removals
    }

    // Callbacks are collected under the lock and invoked after releasing it.
    fn matching<T>(&self, table: &str, pick: impl Fn(&Channel) -> T) -> Vec<T> {
        mutex_lock(&self.state, SOURCE, "matching")
            .channels
            .values()
            .filter(|channel| channel.spec.table == table)
            .map(pick)
            .collect()
    }
}

impl RealtimeTransport for MemoryRealtime {
    fn subscribe(
        &self,
        spec: ChannelSpec,
        on_change: ChangeCallback,
        on_status: StatusCallback,
    ) -> Result<ChannelId, RealtimeError> {
        let id = {
            let mut state = mutex_lock(&self.state, SOURCE, "subscribe");
            if state.closed {
                return Err(RealtimeError::Closed);
            }
            state.next_id += 1;
            state.subscriptions += 1;
            let id = ChannelId(state.next_id);
            state.channels.insert(
                id,
                Channel {
                    spec,
                    on_change,
                    on_status: on_status.clone(),
                },
            );
            id
        };
        if self.auto_subscribe {
            on_status(ChannelStatus::Subscribed);
        }
        Ok(id)
    }

    fn remove_channel(&self, channel: ChannelId) {
        let mut state = mutex_lock(&self.state, SOURCE, "remove_channel");
        if state.channels.remove(&channel).is_some() {
            state.removals += 1;
        }
    }
}
