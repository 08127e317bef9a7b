use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::datastore::{DataStore, StoreError};
use crate::domain::{DomainError, RowOperation, Table};
use crate::sync::{MutationInvalidator, Notifier};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Row writes issued from the admin screens.
///
/// A write that the data store acknowledges invalidates every key derived
/// from its table. A failed write publishes nothing and is reported to the
/// initiating view only.
#[derive(Clone)]
pub struct AdminService {
    store: Arc<dyn DataStore>,
    notifier: Arc<Notifier>,
    invalidator: Option<MutationInvalidator>,
}

impl AdminService {
    pub fn new(store: Arc<dyn DataStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            notifier,
            invalidator: None,
        }
    }

    /// Set the invalidator for this service.
    pub fn with_invalidator(mut self, invalidator: MutationInvalidator) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub async fn insert_row(&self, table: Table, row: Value) -> Result<Value, AdminError> {
        ensure_object(&row, "row")?;
        let result = self.store.insert(table, row).await;
        self.finish(table, RowOperation::Insert, result)
    }

    pub async fn update_row(
        &self,
        table: Table,
        id: &str,
        patch: Value,
    ) -> Result<Value, AdminError> {
        ensure_id(id)?;
        ensure_object(&patch, "patch")?;
        let result = self.store.update(table, id, patch).await;
        self.finish(table, RowOperation::Update, result)
    }

    pub async fn delete_row(&self, table: Table, id: &str) -> Result<(), AdminError> {
        ensure_id(id)?;
        let result = self.store.delete(table, id).await;
        self.finish(table, RowOperation::Delete, result)
    }

    fn finish<T>(
        &self,
        table: Table,
        operation: RowOperation,
        result: Result<T, StoreError>,
    ) -> Result<T, AdminError> {
        match result {
            Ok(value) => {
                if let Some(invalidator) = &self.invalidator {
                    let outcome = invalidator.after_mutation(table, operation);
                    info!(
                        table = %table,
                        operation = operation.as_str(),
                        delivered = outcome.delivered,
                        "Admin mutation applied"
                    );
                }
                Ok(value)
            }
            Err(err) => {
                warn!(
                    table = %table,
                    operation = operation.as_str(),
                    error = %err,
                    "Admin mutation failed"
                );
                self.notifier.error(format!(
                    "{} could not be {}: {err}",
                    table.display_name(),
                    operation.verb()
                ));
                Err(AdminError::from(err))
            }
        }
    }
}

fn ensure_object(value: &Value, field: &str) -> Result<(), DomainError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(DomainError::validation(format!("{field} must be a JSON object")))
    }
}

fn ensure_id(id: &str) -> Result<(), DomainError> {
    if id.trim().is_empty() {
        return Err(DomainError::validation("row id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::datastore::MemoryDataStore;
    use crate::sync::{BusSubscription, EventKind, InvalidationBus, ToastKind};

    type Recorded = Arc<Mutex<Vec<EventKind>>>;

    fn recording_bus() -> (InvalidationBus, Recorded, BusSubscription) {
        let bus = InvalidationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = bus.subscribe("recorder", move |event| {
            sink.lock().expect("lock").push(event.kind);
            Ok(())
        });
        (bus, seen, subscription)
    }

    #[tokio::test]
    async fn successful_delete_publishes_data_changed() {
        let store = Arc::new(MemoryDataStore::new());
        store.seed(Table::SewerQualityData, [json!({"id": 7, "bod": 12})]);
        let (bus, seen, _subscription) = recording_bus();
        let admin = AdminService::new(store.clone(), Arc::new(Notifier::new()))
            .with_invalidator(MutationInvalidator::new(bus));

        admin
            .delete_row(Table::SewerQualityData, "7")
            .await
            .expect("delete");

        assert!(store.rows(Table::SewerQualityData).is_empty());
        assert_eq!(*seen.lock().expect("lock"), vec![EventKind::DataChanged]);
    }

    #[tokio::test]
    async fn failed_write_publishes_nothing_and_raises_error_toast() {
        let store = Arc::new(MemoryDataStore::new());
        store.fail_next_write(Table::WaterSamples, StoreError::Unauthorized);
        let notifier = Arc::new(Notifier::new());
        let mut toasts = notifier.subscribe();
        let (bus, seen, _subscription) = recording_bus();
        let admin =
            AdminService::new(store, notifier).with_invalidator(MutationInvalidator::new(bus));

        let err = admin
            .insert_row(Table::WaterSamples, json!({"site": "tap 4"}))
            .await
            .expect_err("write fails");

        assert!(matches!(err, AdminError::Store(StoreError::Unauthorized)));
        assert!(seen.lock().expect("lock").is_empty());
        let toast = toasts.try_recv().expect("error toast");
        assert_eq!(toast.kind, ToastKind::Error);
        assert!(toast.text.starts_with("Water samples could not be added"));
    }

    #[tokio::test]
    async fn rejects_non_object_rows_before_writing() {
        let store = Arc::new(MemoryDataStore::new());
        let admin = AdminService::new(store.clone(), Arc::new(Notifier::new()));

        let err = admin
            .insert_row(Table::TestParameters, json!([1, 2]))
            .await
            .expect_err("not an object");

        assert!(matches!(err, AdminError::Domain(DomainError::Validation { .. })));
        assert!(store.rows(Table::TestParameters).is_empty());
    }

    #[tokio::test]
    async fn rejects_blank_ids() {
        let admin = AdminService::new(Arc::new(MemoryDataStore::new()), Arc::new(Notifier::new()));
        let err = admin
            .delete_row(Table::WaterSamples, "  ")
            .await
            .expect_err("blank id");
        assert!(matches!(err, AdminError::Domain(_)));
    }
}
