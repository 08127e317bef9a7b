//! Public license-application tracking.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::datastore::{DataStore, SelectQuery, select_fetcher};
use crate::domain::{DomainError, LicenseApplication, Table};
use crate::sync::{CacheKey, FetchError, QueryClient, QueryHandle, QueryOptions, names};

const TRACKING_NUMBER: &str = "tracking_number";

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Looks up applications by tracking number through the query cache, so
/// an admin decision on the application refreshes any open lookup.
#[derive(Clone)]
pub struct ApplicationTracker {
    client: QueryClient,
    store: Arc<dyn DataStore>,
}

impl ApplicationTracker {
    pub fn new(client: QueryClient, store: Arc<dyn DataStore>) -> Self {
        Self { client, store }
    }

    /// `["applicationStatus", number]`
    pub fn key(number: &str) -> CacheKey {
        CacheKey::root(names::APPLICATION_STATUS).segment(number)
    }

    /// Mount a live lookup. The handle's data is the matching rows.
    pub fn watch(&self, number: &str) -> Result<QueryHandle, TrackingError> {
        let number = normalize(number)?;
        let query = SelectQuery::all().eq(TRACKING_NUMBER, &number).limit(1);
        let fetcher = select_fetcher(self.store.clone(), Table::LicenseApplications, query);
        Ok(self
            .client
            .use_query_with(Self::key(&number), fetcher, QueryOptions::default()))
    }

    /// One-shot lookup. `None` when no application carries the number.
    pub async fn lookup(&self, number: &str) -> Result<Option<LicenseApplication>, TrackingError> {
        let mut handle = self.watch(number)?;
        let state = handle.settled().await.unwrap_or_default();
        if let Some(err) = state.error
            && state.data.is_none()
        {
            return Err(TrackingError::Fetch(err));
        }
        let application = decode(&handle)?;
        debug!(
            tracking_number = %number.trim(),
            found = application.is_some(),
            "Application lookup finished"
        );
        Ok(application)
    }
}

/// First matching application in the handle's cached rows.
pub fn decode(handle: &QueryHandle) -> Result<Option<LicenseApplication>, FetchError> {
    let rows: Option<Vec<LicenseApplication>> = handle.data_as()?;
    Ok(rows.and_then(|rows| rows.into_iter().next()))
}

fn normalize(number: &str) -> Result<String, DomainError> {
    let trimmed = number.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("tracking number must not be empty"));
    }
    Ok(trimmed.to_ascii_uppercase())
}
