//! Data store collaborator.
//!
//! The hosted relational store exposes `select`, `insert`, `update` and
//! `delete` on named tables. Views read through [`select_fetcher`], which
//! adapts a select into a query fetch function; writes go through the admin
//! service so that successful mutations invalidate derived keys.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;

use crate::domain::Table;
use crate::sync::{FetchError, Fetcher};

mod memory;
mod rest;

pub use memory::MemoryDataStore;
pub use rest::RestDataStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(String),
    #[error("request timed out")]
    Timeout,
    #[error("data store returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("session expired or not authorized")]
    Unauthorized,
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("row `{id}` not found in `{table}`")]
    NotFound { table: Table, id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Http(err.to_string())
        }
    }
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout => FetchError::Timeout,
            StoreError::Unauthorized => FetchError::SessionExpired,
            StoreError::Decode(message) => FetchError::Decode(message),
            other => FetchError::Store(other.to_string()),
        }
    }
}

/// Comparison used by a row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lte,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Gte => "gte",
            FilterOp::Lte => "lte",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Row selection: filters, ordering and an optional limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    pub order: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(self, column: impl Into<String>, value: impl fmt::Display) -> Self {
        self.filter(column, FilterOp::Eq, value)
    }

    pub fn gte(self, column: impl Into<String>, value: impl fmt::Display) -> Self {
        self.filter(column, FilterOp::Gte, value)
    }

    pub fn lte(self, column: impl Into<String>, value: impl fmt::Display) -> Self {
        self.filter(column, FilterOp::Lte, value)
    }

    fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl fmt::Display) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op,
            value: value.to_string(),
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order = Some((column.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Request/response surface of the hosted data store.
///
/// Row-level security is enforced server-side; an expired session surfaces
/// as [`StoreError::Unauthorized`].
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Value>, StoreError>;

    /// Insert one row and return it as stored.
    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError>;

    /// Merge `patch` into the row with primary key `id`.
    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, StoreError>;

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError>;
}

/// Fetch function that runs `query` against `table` and yields the rows as a
/// JSON array.
pub fn select_fetcher(store: Arc<dyn DataStore>, table: Table, query: SelectQuery) -> Fetcher {
    Arc::new(move || {
        let store = store.clone();
        let query = query.clone();
        async move {
            store
                .select(table, &query)
                .await
                .map(Value::Array)
                .map_err(FetchError::from)
        }
        .boxed()
    })
}
