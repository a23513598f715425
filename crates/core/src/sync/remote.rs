//! Trait boundary to the remote REST store.
//!
//! The engine and query layer only ever see this trait; the HTTP client
//! lives in its own crate and tests substitute an in-memory fake. Rows
//! cross the boundary in wire shape (snake_case columns, numeric ids).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::Result;
use crate::model::Table;

/// Keyset position for paging transactions backwards through history.
/// Identifies the oldest row already loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageCursor {
    pub date: DateTime<Utc>,
    pub id: i64,
}

/// Optional closed date range narrowing a transaction page fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DateBounds {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All of the user's rows in one table.
    async fn list(&self, table: Table) -> Result<Vec<Value>>;

    /// Create one row. The returned row carries the assigned numeric id.
    async fn insert(&self, table: Table, row: Value) -> Result<Value>;

    /// Create several rows in one request, echoed back in order.
    async fn insert_many(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>>;

    async fn update(&self, table: Table, id: i64, patch: Value) -> Result<Value>;

    async fn delete(&self, table: Table, id: i64) -> Result<()>;

    /// Delete every row of the user's in one table.
    async fn delete_all(&self, table: Table) -> Result<()>;

    /// Drop cached report rows whose expiry has passed.
    async fn prune_expired_reports(&self, now: DateTime<Utc>) -> Result<()>;

    /// Drop cached report rows covering `date` or anything after it.
    /// A transaction landing in that range makes them stale.
    async fn invalidate_report_periods(&self, date: DateTime<Utc>) -> Result<()>;

    /// Transactions strictly older than `cursor` (or the newest page when
    /// `None`), newest first, at most `limit` rows.
    async fn transactions_before(
        &self,
        cursor: Option<PageCursor>,
        bounds: DateBounds,
        limit: usize,
    ) -> Result<Vec<Value>>;
}
