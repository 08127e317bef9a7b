//! Dataset views and their mount/unmount lifecycle.
//!
//! A view owns up to three resources: a query subscription, a realtime
//! bridge for its table, and leases on shared poll timers. Unmounting
//! releases all of them exactly once, whether through [`DatasetView::unmount`]
//! or by dropping the view.

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::context::PortalContext;
use crate::datastore::{Direction, SelectQuery, select_fetcher};
use crate::domain::Table;
use crate::sync::{
    BridgeState, CacheKey, PollConfig, PollLease, QueryHandle, QueryOptions, QueryState,
    RealtimeBridge, SyncConfig, derived_keys_for, names,
};

const HOMEPAGE_LIMIT: usize = 100;
const SAMPLED_AT: &str = "sampled_at";
const ALL: &str = "all";

/// What a view reads and which freshness sources keep it current.
#[derive(Debug, Clone)]
pub struct ViewSpec {
    pub key: CacheKey,
    pub table: Table,
    pub query: SelectQuery,
    pub options: QueryOptions,
    pub realtime: bool,
    pub polls: Vec<PollConfig>,
}

impl ViewSpec {
    pub fn new(key: CacheKey, table: Table) -> Self {
        Self {
            key,
            table,
            query: SelectQuery::all(),
            options: QueryOptions::default(),
            realtime: false,
            polls: Vec::new(),
        }
    }

    pub fn query(mut self, query: SelectQuery) -> Self {
        self.query = query;
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Subscribe to row changes on the view's table while mounted.
    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    pub fn poll(mut self, config: PollConfig) -> Self {
        self.polls.push(config);
        self
    }

    /// Latest water readings on the public homepage.
    pub fn homepage_water(config: &SyncConfig) -> Self {
        Self::homepage(names::WATER_DATA_QUERY_KEY, Table::WaterQualityData, config)
    }

    /// Latest sewer readings on the public homepage.
    pub fn homepage_sewer(config: &SyncConfig) -> Self {
        Self::homepage(names::SEWER_DATA_QUERY_KEY, Table::SewerQualityData, config)
    }

    fn homepage(name: &str, table: Table, config: &SyncConfig) -> Self {
        Self::new(CacheKey::root(name), table)
            .query(
                SelectQuery::all()
                    .order_by(SAMPLED_AT, Direction::Descending)
                    .limit(HOMEPAGE_LIMIT),
            )
            .realtime(true)
            .poll(PollConfig::operational(config))
    }

    /// Admin water table filtered to a date range.
    pub fn admin_water(from: &str, to: &str, config: &SyncConfig) -> Self {
        Self::admin(names::ADMIN_WATER_DATA, Table::WaterQualityData, from, to, config)
    }

    /// Admin sewer table filtered to a date range.
    pub fn admin_sewer(from: &str, to: &str, config: &SyncConfig) -> Self {
        Self::admin(names::ADMIN_SEWER_DATA, Table::SewerQualityData, from, to, config)
    }

    // Key layout: [name, {from, to}, plant, parameter].
    fn admin(name: &str, table: Table, from: &str, to: &str, config: &SyncConfig) -> Self {
        let key = CacheKey::root(name)
            .segment(json!({ "from": from, "to": to }))
            .segment(ALL)
            .segment(ALL);
        Self::new(key, table)
            .query(
                SelectQuery::all()
                    .gte(SAMPLED_AT, from)
                    .lte(SAMPLED_AT, to)
                    .order_by(SAMPLED_AT, Direction::Descending),
            )
            .poll(PollConfig::operational(config))
    }
}

/// A mounted dataset view.
pub struct DatasetView {
    query: Option<QueryHandle>,
    bridge: Option<RealtimeBridge>,
    leases: Vec<PollLease>,
}

impl DatasetView {
    pub(crate) fn mount(context: &PortalContext, spec: ViewSpec) -> Self {
        let fetcher = select_fetcher(context.store().clone(), spec.table, spec.query);
        let query = context
            .client()
            .use_query_with(spec.key, fetcher, spec.options);

        let bridge = spec.realtime.then(|| {
            let bridge = RealtimeBridge::new(
                context.realtime().clone(),
                context.bus().clone(),
                spec.table,
                derived_keys_for(spec.table),
            );
            // Polling keeps the view fresh while realtime is unavailable.
            if let Err(err) = bridge.connect() {
                warn!(table = %spec.table, error = %err, "Realtime unavailable for view");
            }
            bridge
        });

        let leases = spec
            .polls
            .into_iter()
            .map(|config| context.polls().acquire(config))
            .collect();

        debug!(cache_key = %query.key(), table = %spec.table, "View mounted");
        Self {
            query: Some(query),
            bridge,
            leases,
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.query.as_ref().map(QueryHandle::key)
    }

    /// Latest state, or the idle state once unmounted.
    pub fn state(&self) -> QueryState {
        self.query
            .as_ref()
            .map(QueryHandle::state)
            .unwrap_or_default()
    }

    /// Rows of the last successful fetch.
    pub fn rows(&self) -> Vec<Value> {
        match self.state().data {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        }
    }

    pub fn realtime_state(&self) -> Option<BridgeState> {
        self.bridge.as_ref().map(RealtimeBridge::state)
    }

    /// Wait for the next state change.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.query.as_mut()?.changed().await
    }

    pub async fn wait_until<F>(&mut self, condition: F) -> Option<QueryState>
    where
        F: FnMut(&QueryState) -> bool,
    {
        self.query.as_mut()?.wait_until(condition).await
    }

    pub async fn settled(&mut self) -> Option<QueryState> {
        self.query.as_mut()?.settled().await
    }

    /// Fetch now, ignoring the freshness window.
    pub async fn refetch(&self) -> Option<QueryState> {
        Some(self.query.as_ref()?.refetch().await)
    }

    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.disconnect();
        }
        for mut lease in self.leases.drain(..) {
            lease.release();
        }
        if let Some(query) = self.query.take() {
            debug!(cache_key = %query.key(), "View unmounted");
            query.unmount();
        }
    }
}

impl Drop for DatasetView {
    fn drop(&mut self) {
        self.teardown();
    }
}
