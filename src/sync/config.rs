//! Synchronization configuration.
//!
//! Controls the freshness window, fetch retry policy, request timeout, the
//! garbage-collection sweep and the two poll cadences. Built from the
//! `[sync]`, `[store]` and `[polling]` sections of `aquasync.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_STALE_TIME_MS: u64 = 30_000;
const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_RETRY: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 0;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_OPERATIONAL_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CHART_INTERVAL_MS: u64 = 30_000;

/// Tunables for the query client, poll timers and garbage collection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Freshness window after a successful fetch.
    pub stale_time_ms: u64,
    /// Cadence of the garbage-collection sweep over unobserved entries.
    pub gc_interval_ms: u64,
    /// Retries after a failed fetch before the error is surfaced.
    pub retry: u32,
    /// Pause between retries. Zero retries immediately.
    pub retry_delay_ms: u64,
    /// Upper bound on a single fetch attempt.
    pub request_timeout_ms: u64,
    /// Cadence of the operational-data poll timer.
    pub operational_interval_ms: u64,
    /// Cadence of the chart poll timer.
    pub chart_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            retry: DEFAULT_RETRY,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            operational_interval_ms: DEFAULT_OPERATIONAL_INTERVAL_MS,
            chart_interval_ms: DEFAULT_CHART_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::Settings> for SyncConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            stale_time_ms: settings.sync.stale_time.as_millis() as u64,
            gc_interval_ms: settings.sync.gc_interval.as_millis() as u64,
            retry: settings.sync.retry,
            retry_delay_ms: settings.sync.retry_delay.as_millis() as u64,
            request_timeout_ms: settings.store.request_timeout.as_millis() as u64,
            operational_interval_ms: settings.polling.operational_interval.as_millis() as u64,
            chart_interval_ms: settings.polling.chart_interval.as_millis() as u64,
        }
    }
}

impl SyncConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    /// Sweep cadence, clamped to at least one millisecond.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Request timeout, clamped to at least one millisecond.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    /// Operational poll cadence, clamped to at least one millisecond.
    pub fn operational_interval(&self) -> Duration {
        Duration::from_millis(self.operational_interval_ms.max(1))
    }

    /// Chart poll cadence, clamped to at least one millisecond.
    pub fn chart_interval(&self) -> Duration {
        Duration::from_millis(self.chart_interval_ms.max(1))
    }
}
