//! Mutation-triggered invalidation.
//!
//! After a local write succeeds, every cache key derived from the written
//! table is invalidated so that views elsewhere in the portal converge
//! without waiting for a poll tick.

use tracing::info;

use super::bus::{InvalidationBus, PublishOutcome};
use super::events::InvalidationEvent;
use super::keys::{CacheKey, names};
use crate::domain::{RowOperation, Table};

/// Cache-key prefixes whose data is read from `table`.
///
/// Keep this in step with the queries views run; a missing prefix leaves a
/// view stale until its poll timer fires.
pub fn derived_keys_for(table: Table) -> Vec<CacheKey> {
    let prefixes: &[&str] = match table {
        Table::WaterQualityData => &[
            names::ADMIN_WATER_DATA,
            names::WATER_DATA,
            names::WATER_DATA_QUERY_KEY,
            names::DASHBOARD_STATS,
        ],
        Table::SewerQualityData => &[
            names::ADMIN_SEWER_DATA,
            names::SEWER_DATA,
            names::SEWER_DATA_QUERY_KEY,
            names::DASHBOARD_STATS,
        ],
        Table::WaterSamples => &[names::ADMIN_SAMPLES, names::SAMPLES, names::DASHBOARD_STATS],
        Table::TestParameters => &[names::ADMIN_PARAMETERS, names::TEST_PARAMETERS],
        Table::LicenseApplications => &[names::ADMIN_APPLICATIONS, names::APPLICATION_STATUS],
    };
    prefixes.iter().copied().map(CacheKey::root).collect()
}

/// Publishes `DataChanged` for a table once a write to it has succeeded.
#[derive(Clone)]
pub struct MutationInvalidator {
    bus: InvalidationBus,
}

impl MutationInvalidator {
    pub fn new(bus: InvalidationBus) -> Self {
        Self { bus }
    }

    /// Call only after the write has been acknowledged by the data store.
    pub fn after_mutation(&self, table: Table, operation: RowOperation) -> PublishOutcome {
        let targets = derived_keys_for(table);
        info!(
            table = %table,
            operation = operation.as_str(),
            targets = targets.len(),
            "Mutation committed, invalidating derived keys"
        );
        self.bus
            .publish(InvalidationEvent::data_changed(targets, table.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::sync::events::EventKind;

    #[test]
    fn sewer_mutation_reaches_homepage_key() {
        let keys = derived_keys_for(Table::SewerQualityData);
        assert!(keys.contains(&CacheKey::root(names::SEWER_DATA_QUERY_KEY)));
        assert!(keys.contains(&CacheKey::root(names::ADMIN_SEWER_DATA)));
        assert!(keys.contains(&CacheKey::root(names::SEWER_DATA)));
        assert!(!keys.contains(&CacheKey::root(names::WATER_DATA)));
    }

    #[test]
    fn every_table_has_derived_keys() {
        for table in Table::ALL {
            assert!(!derived_keys_for(table).is_empty(), "{table} has no derived keys");
        }
    }

    #[test]
    fn after_mutation_publishes_one_data_changed_event() {
        let bus = InvalidationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = bus.subscribe("recorder", move |event| {
            sink.lock().expect("lock").push(event.clone());
            Ok(())
        });

        let invalidator = MutationInvalidator::new(bus);
        let outcome = invalidator.after_mutation(Table::WaterSamples, RowOperation::Delete);
        assert_eq!(outcome.delivered, 1);

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, EventKind::DataChanged);
        assert_eq!(seen[0].source_label, "water_samples");
        assert_eq!(seen[0].targets, derived_keys_for(Table::WaterSamples));
    }
}
