//! In-process data store for tests and demos.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{DataStore, Direction, Filter, FilterOp, SelectQuery, StoreError};
use crate::domain::Table;
use crate::sync::lock::mutex_lock;

const SOURCE: &str = "datastore::memory";

#[derive(Default)]
struct Tables {
    rows: HashMap<Table, Vec<Value>>,
    next_id: u64,
    selects: HashMap<Table, usize>,
    failures: HashMap<Table, StoreError>,
}

/// Keeps rows in memory and counts selects per table.
#[derive(Default)]
pub struct MemoryDataStore {
    tables: Mutex<Tables>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `table` with rows, bypassing mutation bookkeeping.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        let mut tables = mutex_lock(&self.tables, SOURCE, "seed");
        tables.rows.entry(table).or_default().extend(rows);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *mutex_lock(&self.latency, SOURCE, "set_latency") = Some(latency);
    }

    /// Make the next write to `table` fail with `error`.
    pub fn fail_next_write(&self, table: Table, error: StoreError) {
        mutex_lock(&self.tables, SOURCE, "fail_next_write")
            .failures
            .insert(table, error);
    }

    /// Number of `select` calls made against `table`.
    pub fn select_count(&self, table: Table) -> usize {
        mutex_lock(&self.tables, SOURCE, "select_count")
            .selects
            .get(&table)
            .copied()
            .unwrap_or(0)
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        mutex_lock(&self.tables, SOURCE, "rows")
            .rows
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    async fn delay(&self) {
        let latency = *mutex_lock(&self.latency, SOURCE, "delay");
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Value>, StoreError> {
        *mutex_lock(&self.tables, SOURCE, "select")
            .selects
            .entry(table)
            .or_default() += 1;
        self.delay().await;

        let tables = mutex_lock(&self.tables, SOURCE, "select");
        let mut rows: Vec<Value> = tables
            .rows
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|row| query.filters.iter().all(|filter| matches(row, filter)))
            .cloned()
            .collect();
        drop(tables);

        if let Some((column, direction)) = &query.order {
            rows.sort_by(|a, b| {
                let ordering = compare(a.get(column), b.get(column));
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
        self.delay().await;
        let mut tables = mutex_lock(&self.tables, SOURCE, "insert");
        if let Some(error) = tables.failures.remove(&table) {
            return Err(error);
        }
        let Value::Object(mut fields) = row else {
            return Err(StoreError::InvalidInput("row must be a JSON object".to_string()));
        };
        if !fields.contains_key("id") {
            tables.next_id += 1;
            fields.insert("id".to_string(), Value::from(tables.next_id));
        }
        let row = Value::Object(fields);
        tables.rows.entry(table).or_default().push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, StoreError> {
        self.delay().await;
        let mut tables = mutex_lock(&self.tables, SOURCE, "update");
        if let Some(error) = tables.failures.remove(&table) {
            return Err(error);
        }
        let Value::Object(patch) = patch else {
            return Err(StoreError::InvalidInput("patch must be a JSON object".to_string()));
        };
        let row = tables
            .rows
            .get_mut(&table)
            .and_then(|rows| rows.iter_mut().find(|row| has_id(row, id)))
            .ok_or_else(|| StoreError::NotFound {
                table,
                id: id.to_string(),
            })?;
        if let Value::Object(fields) = &mut *row {
            merge(fields, patch);
        }
        Ok(row.clone())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
        self.delay().await;
        let mut tables = mutex_lock(&self.tables, SOURCE, "delete");
        if let Some(error) = tables.failures.remove(&table) {
            return Err(error);
        }
        let rows = tables.rows.entry(table).or_default();
        let before = rows.len();
        rows.retain(|row| !has_id(row, id));
        if rows.len() == before {
            return Err(StoreError::NotFound {
                table,
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn has_id(row: &Value, id: &str) -> bool {
    row.get("id").is_some_and(|value| text(value) == id)
}

fn matches(row: &Value, filter: &Filter) -> bool {
    let Some(value) = row.get(&filter.column) else {
        return false;
    };
    let ordering = compare(Some(value), Some(&Value::String(filter.value.clone())));
    match filter.op {
        FilterOp::Eq => text(value) == filter.value,
        FilterOp::Gte => ordering != Ordering::Less,
        FilterOp::Lte => ordering != Ordering::Greater,
    }
}

// Numbers compare numerically when both sides parse, everything else as text.
fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let (a, b) = (text(a), text(b));
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => a.cmp(&b),
            }
        }
    }
}

fn merge(fields: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (name, value) in patch {
        fields.insert(name, value);
    }
}
