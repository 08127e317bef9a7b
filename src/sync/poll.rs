//! Poll timers.
//!
//! A poll timer publishes a silent invalidation for a fixed set of keys on a
//! fixed cadence, so data stays reasonably fresh even when no realtime event
//! or user action arrives. [`PollRegistry`] keeps at most one running timer
//! per configuration no matter how many views ask for it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::bus::InvalidationBus;
use super::config::SyncConfig;
use super::events::InvalidationEvent;
use super::keys::{CacheKey, names};
use super::lock::mutex_lock;

const SOURCE: &str = "sync::poll";

pub const OPERATIONAL: &str = "operational";
pub const CHART: &str = "chart";

/// What a timer invalidates and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub name: String,
    pub interval: Duration,
    pub keys: Vec<CacheKey>,
}

impl PollConfig {
    pub fn new(name: impl Into<String>, interval: Duration, keys: Vec<CacheKey>) -> Self {
        Self {
            name: name.into(),
            interval,
            keys,
        }
    }

    /// Mutable operational data shown in tables.
    pub fn operational(config: &SyncConfig) -> Self {
        Self::new(
            OPERATIONAL,
            config.operational_interval(),
            [
                names::WATER_DATA,
                names::SEWER_DATA,
                names::WATER_DATA_QUERY_KEY,
                names::SEWER_DATA_QUERY_KEY,
                names::ADMIN_WATER_DATA,
                names::ADMIN_SEWER_DATA,
            ]
            .into_iter()
            .map(CacheKey::root)
            .collect(),
        )
    }

    /// Dashboard chart aggregates.
    pub fn chart(config: &SyncConfig) -> Self {
        Self::new(
            CHART,
            config.chart_interval(),
            vec![CacheKey::root(names::DASHBOARD_STATS)],
        )
    }

    fn label(&self) -> String {
        format!("poll:{}", self.name)
    }
}

/// A repeating timer owned by whoever started it.
pub struct PollTimer {
    config: PollConfig,
    bus: InvalidationBus,
    task: Option<JoinHandle<()>>,
}

impl PollTimer {
    pub fn new(config: PollConfig, bus: InvalidationBus) -> Self {
        Self {
            config,
            bus,
            task: None,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start ticking. The first tick fires one interval from now. Starting a
    /// running timer does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(timer = %self.config.name, "Poll timer not started: no async runtime");
            return;
        };

        let bus = self.bus.clone();
        let keys = self.config.keys.clone();
        let label = self.config.label();
        let period = self.config.interval.max(Duration::from_millis(1));

        self.task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bus.publish(InvalidationEvent::invalidate_all(keys.clone(), label.as_str()));
            }
        }));
        debug!(
            timer = %self.config.name,
            interval_ms = period.as_millis() as u64,
            "Poll timer started"
        );
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(timer = %self.config.name, "Poll timer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Slot {
    timer: PollTimer,
    leases: usize,
}

struct RegistryInner {
    bus: InvalidationBus,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Shares poll timers between views by configuration name.
#[derive(Clone)]
pub struct PollRegistry {
    inner: Arc<RegistryInner>,
}

impl PollRegistry {
    pub fn new(bus: InvalidationBus) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                bus,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Take a lease on the timer for `config.name`, starting it if this is
    /// the first lease. The timer stops when the last lease is dropped.
    ///
    /// While a timer runs, later leases share it even if they pass a
    /// different interval or key set; the mismatch is logged.
    pub fn acquire(&self, config: PollConfig) -> PollLease {
        let name = config.name.clone();
        let mut slots = mutex_lock(&self.inner.slots, SOURCE, "acquire");
        let slot = match slots.entry(name.clone()) {
            Entry::Occupied(occupied) => {
                let slot = occupied.into_mut();
                let running = slot.timer.config();
                if *running != config {
                    warn!(
                        timer = %name,
                        running_interval_ms = running.interval.as_millis() as u64,
                        requested_interval_ms = config.interval.as_millis() as u64,
                        running_keys = running.keys.len(),
                        requested_keys = config.keys.len(),
                        "Poll lease config differs from the running timer; keeping the running one"
                    );
                }
                slot
            }
            Entry::Vacant(vacant) => vacant.insert(Slot {
                timer: PollTimer::new(config, self.inner.bus.clone()),
                leases: 0,
            }),
        };
        slot.leases += 1;
        slot.timer.start();

        PollLease {
            registry: Arc::downgrade(&self.inner),
            name: Some(name),
        }
    }

    /// Number of timers currently running.
    pub fn active_timers(&self) -> usize {
        mutex_lock(&self.inner.slots, SOURCE, "active_timers")
            .values()
            .filter(|slot| slot.timer.is_running())
            .count()
    }

    /// Configuration of the timer registered under `name`.
    pub fn config(&self, name: &str) -> Option<PollConfig> {
        mutex_lock(&self.inner.slots, SOURCE, "config")
            .get(name)
            .map(|slot| slot.timer.config().clone())
    }

    pub fn leases(&self, name: &str) -> usize {
        mutex_lock(&self.inner.slots, SOURCE, "leases")
            .get(name)
            .map_or(0, |slot| slot.leases)
    }
}

/// Keeps a shared poll timer alive. Dropping it releases the lease.
pub struct PollLease {
    registry: Weak<RegistryInner>,
    name: Option<String>,
}

impl PollLease {
    pub fn release(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let removed = {
            let mut slots = mutex_lock(&registry.slots, SOURCE, "release");
            match slots.get_mut(&name) {
                Some(slot) if slot.leases > 1 => {
                    slot.leases -= 1;
                    None
                }
                _ => slots.remove(&name),
            }
        };
        // Stopped outside the lock.
        drop(removed);
    }
}

impl Drop for PollLease {
    fn drop(&mut self) {
        self.release();
    }
}
