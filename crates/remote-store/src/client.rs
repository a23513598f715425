//! HTTP client for a PostgREST-style REST backend.
//!
//! Every request is scoped to the signed-in user through a `user_id`
//! filter, writes ask for the mutated representation back, and keyset
//! pagination is expressed with the backend's `or=(...)` filter syntax.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use ledgerpouch_core::model::Table;
use ledgerpouch_core::sync::{DateBounds, PageCursor, RemoteStore};
use ledgerpouch_core::Result as CoreResult;

use crate::error::{RemoteStoreError, Result};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Client for the cloud REST store.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    user_id: String,
}

impl RestStore {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the backend (e.g., "https://db.example.app")
    /// * `api_key` - Bearer key for the REST endpoint
    /// * `user_id` - Owner every request is scoped to
    pub fn new(base_url: &str, api_key: &str, user_id: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            user_id: user_id.to_string(),
        }
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn user_filter(&self) -> (String, String) {
        ("user_id".to_string(), format!("eq.{}", self.user_id))
    }

    /// Create headers for an API request.
    fn headers(&self, returning: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key_value = HeaderValue::from_str(&self.api_key)
            .map_err(|_| RemoteStoreError::auth("Invalid API key format"))?;
        headers.insert("apikey", key_value);

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| RemoteStoreError::auth("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        if returning {
            headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        }
        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    /// Parse a JSON array response body.
    async fn parse_rows(response: reqwest::Response) -> Result<Vec<Value>> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                let code = error.code.unwrap_or_else(|| "error".to_string());
                return Err(RemoteStoreError::api(
                    status.as_u16(),
                    format!("{}: {}", code, error.message),
                ));
            }
            return Err(RemoteStoreError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        if body.is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(rows)) => Ok(rows),
            Ok(row) => Ok(vec![row]),
            Err(e) => Err(RemoteStoreError::api(
                status.as_u16(),
                format!("Failed to parse response: {}", e),
            )),
        }
    }

    async fn send(
        &self,
        method: Method,
        table: Table,
        query: &[(String, String)],
        body: Option<&Value>,
        returning: bool,
    ) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .request(method, self.table_url(table))
            .headers(self.headers(returning)?)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::parse_rows(request.send().await?).await
    }

    async fn fetch_rows(&self, table: Table, query: &[(String, String)]) -> Result<Vec<Value>> {
        self.send(Method::GET, table, query, None, false).await
    }

    async fn delete_where(&self, table: Table, query: &[(String, String)]) -> Result<()> {
        self.send(Method::DELETE, table, query, None, false).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn list(&self, table: Table) -> CoreResult<Vec<Value>> {
        let query = vec![self.user_filter(), ("select".to_string(), "*".to_string())];
        Ok(self.fetch_rows(table, &query).await?)
    }

    async fn insert(&self, table: Table, row: Value) -> CoreResult<Value> {
        let rows = self
            .send(Method::POST, table, &[], Some(&row), true)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteStoreError::invalid_request("insert returned no row").into())
    }

    async fn insert_many(&self, table: Table, rows: Vec<Value>) -> CoreResult<Vec<Value>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let body = Value::Array(rows);
        Ok(self.send(Method::POST, table, &[], Some(&body), true).await?)
    }

    async fn update(&self, table: Table, id: i64, patch: Value) -> CoreResult<Value> {
        let query = vec![("id".to_string(), format!("eq.{id}")), self.user_filter()];
        let rows = self
            .send(Method::PATCH, table, &query, Some(&patch), true)
            .await?;
        // an empty representation means no row matched the filter
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteStoreError::api(404, "no matching row").into())
    }

    async fn delete(&self, table: Table, id: i64) -> CoreResult<()> {
        let query = vec![("id".to_string(), format!("eq.{id}")), self.user_filter()];
        Ok(self.delete_where(table, &query).await?)
    }

    async fn delete_all(&self, table: Table) -> CoreResult<()> {
        let query = vec![self.user_filter()];
        Ok(self.delete_where(table, &query).await?)
    }

    async fn prune_expired_reports(&self, now: DateTime<Utc>) -> CoreResult<()> {
        let query = vec![
            self.user_filter(),
            ("expires_at".to_string(), format!("lt.{}", now.to_rfc3339())),
        ];
        Ok(self.delete_where(Table::ReportCache, &query).await?)
    }

    async fn invalidate_report_periods(&self, date: DateTime<Utc>) -> CoreResult<()> {
        let query = vec![
            self.user_filter(),
            (
                "last_transaction_date".to_string(),
                format!("gte.{}", date.to_rfc3339()),
            ),
        ];
        Ok(self.delete_where(Table::ReportCache, &query).await?)
    }

    async fn transactions_before(
        &self,
        cursor: Option<PageCursor>,
        bounds: DateBounds,
        limit: usize,
    ) -> CoreResult<Vec<Value>> {
        let mut query = vec![
            self.user_filter(),
            ("select".to_string(), "*".to_string()),
            ("order".to_string(), "date.desc,id.desc".to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            let ts = cursor.date.to_rfc3339();
            query.push((
                "or".to_string(),
                format!(
                    "(date.lt.\"{ts}\",and(date.eq.\"{ts}\",id.lt.{}))",
                    cursor.id
                ),
            ));
        }
        if let Some(from) = bounds.from {
            query.push(("date".to_string(), format!("gte.{}", from.to_rfc3339())));
        }
        if let Some(to) = bounds.to {
            query.push(("date".to_string(), format!("lt.{}", to.to_rfc3339())));
        }
        Ok(self.fetch_rows(Table::Transactions, &query).await?)
    }
}
