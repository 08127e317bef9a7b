//! Data-freshness and cross-view synchronization.
//!
//! This module provides:
//! - `CacheStore` for keyed query results with staleness tracking
//! - `QueryClient` to mount queries and drive fetch, retry and refetch
//! - `InvalidationBus` to fan invalidation events out to listeners
//! - `RealtimeBridge` and `PollTimer` as invalidation publishers
//! - `MutationInvalidator` to refresh every view derived from a written table
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌────────────┐  ┌─────────────────────┐
//! │RealtimeBridge│  │ PollTimer  │  │ MutationInvalidator │
//! └──────┬───────┘  └─────┬──────┘  └──────────┬──────────┘
//!        └────────────────┼────────────────────┘
//!                         ▼
//!                 ┌───────────────┐
//!                 │InvalidationBus│──────► Notifier (toasts)
//!                 └───────┬───────┘
//!                         ▼
//!                 ┌───────────────┐      ┌────────────┐
//!                 │  QueryClient  │─────►│ CacheStore │
//!                 └───────┬───────┘      └────────────┘
//!                         ▼
//!                   QueryHandle (one per mounted view)
//! ```

pub(crate) mod lock;

pub mod bus;
pub mod config;
pub mod events;
pub mod keys;
pub mod mutation;
pub mod notify;
pub mod poll;
pub mod query;
pub mod realtime;
pub mod store;

pub use bus::{BusSubscription, HandlerError, InvalidationBus, PublishOutcome};
pub use config::SyncConfig;
pub use events::{Epoch, EventKind, InvalidationEvent};
pub use keys::{CacheKey, names};
pub use mutation::{MutationInvalidator, derived_keys_for};
pub use notify::{Notifier, Toast, ToastKind};
pub use poll::{PollConfig, PollLease, PollRegistry, PollTimer};
pub use query::{FetchError, Fetcher, QueryClient, QueryHandle, QueryOptions};
pub use realtime::{
    BridgeState, ChangeCallback, ChangeEvent, ChannelId, ChannelSpec, ChannelStatus,
    RealtimeBridge, RealtimeError, RealtimeTransport, StatusCallback,
};
pub use store::{CacheEntry, CacheStore, EntryPatch, Invalidation, QueryState, QueryStatus};
