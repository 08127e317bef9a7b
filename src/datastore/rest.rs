//! HTTP data store speaking the PostgREST dialect of the hosted backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, Response, Url};
use serde_json::Value;
use tracing::debug;

use super::{DataStore, Direction, SelectQuery, StoreError};
use crate::domain::Table;

const REST_PATH: &str = "rest/v1/";

#[derive(Clone, Debug)]
pub struct RestDataStore {
    client: Client,
    base: Url,
}

impl RestDataStore {
    pub fn new(site: &str, api_key: &str, timeout: Duration) -> Result<Self, StoreError> {
        let base = rest_base(site)
            .map_err(|err| StoreError::InvalidInput(format!("invalid store url: {err}")))?;

        let mut headers = HeaderMap::new();
        headers.insert("apikey", header_value(api_key)?);
        headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {api_key}"))?);

        let client = Client::builder()
            .user_agent(Self::user_agent())
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("aquasync/", env!("CARGO_PKG_VERSION"))
    }

    fn url(&self, table: Table) -> Result<Url, StoreError> {
        self.base
            .join(table.as_str())
            .map_err(|err| StoreError::InvalidInput(err.to_string()))
    }

    fn select_url(&self, table: Table, query: &SelectQuery) -> Result<Url, StoreError> {
        let mut url = self.url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            for filter in &query.filters {
                pairs.append_pair(
                    &filter.column,
                    &format!("{}.{}", filter.op.as_str(), filter.value),
                );
            }
            if let Some((column, direction)) = &query.order {
                let direction = match direction {
                    Direction::Ascending => "asc",
                    Direction::Descending => "desc",
                };
                pairs.append_pair("order", &format!("{column}.{direction}"));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    fn row_url(&self, table: Table, id: &str) -> Result<Url, StoreError> {
        let mut url = self.url(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Vec<Value>, StoreError> {
        debug!(method = %method, url = %url, "Data store request");
        let mut request = self
            .client
            .request(method, url)
            .header("Prefer", "return=representation");
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        Self::handle(response).await
    }

    async fn handle(response: Response) -> Result<Vec<Value>, StoreError> {
        let status = response.status();
        let bytes = response.bytes().await?;
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(StoreError::Unauthorized);
        }
        if !status.is_success() {
            let message = String::from_utf8_lossy(&bytes).into_owned();
            return Err(StoreError::Status {
                status: status.as_u16(),
                message,
            });
        }
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|err| StoreError::Decode(err.to_string()))
    }
}

#[async_trait]
impl DataStore for RestDataStore {
    async fn select(&self, table: Table, query: &SelectQuery) -> Result<Vec<Value>, StoreError> {
        let url = self.select_url(table, query)?;
        self.send(Method::GET, url, None).await
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
        let url = self.url(table)?;
        let rows = self.send(Method::POST, url, Some(row)).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no row".to_string()))
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, StoreError> {
        let url = self.row_url(table, id)?;
        let rows = self.send(Method::PATCH, url, Some(patch)).await?;
        rows.into_iter().next().ok_or_else(|| StoreError::NotFound {
            table,
            id: id.to_string(),
        })
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
        let url = self.row_url(table, id)?;
        let rows = self.send(Method::DELETE, url, None).await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound {
                table,
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

/// `{site}/rest/v1/`, keeping any path prefix the site is served under.
fn rest_base(site: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(site)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    url.join(REST_PATH)
}

fn header_value(value: &str) -> Result<HeaderValue, StoreError> {
    HeaderValue::from_str(value).map_err(|err| StoreError::InvalidInput(err.to_string()))
}
