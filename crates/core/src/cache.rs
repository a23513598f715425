//! Durable local store for the signed-in user's records.
//!
//! Every entity table is a keyed set of camelCase JSON documents. Reads
//! always hit this store, never the network. Mutations stamp timestamps,
//! assign temporary ids to offline creations and, when cloud sync is
//! enabled, append a matching entry to the sync queue inside the same
//! connection lock so the record and its queue entry can never diverge.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::errors::{Error, Result};
use crate::ledger::LedgerEffect;
use crate::model::{to_wire_patch, to_wire_row, RecordId, Table};
use crate::outbox::{self, Operation, Outbox};
use crate::runtime::{Clock, SystemClock};

const META_CLOUD_SYNC: &str = "cloud_sync_enabled";
const META_LAST_SYNC: &str = "last_sync_at";

/// Newest transactions kept locally; older history stays on the remote
/// and is paged in on demand.
pub const TRANSACTION_CACHE_LIMIT: usize = 50;

pub(crate) struct StoreInner {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) user_id: String,
    pub(crate) clock: Arc<dyn Clock>,
    sync_enabled: AtomicBool,
    pub(crate) pending: watch::Sender<usize>,
}

impl StoreInner {
    /// Re-publish the queue depth to watchers after a mutation.
    pub(crate) fn refresh_pending(&self) {
        let count = self
            .conn
            .lock()
            .ok()
            .and_then(|conn| outbox::queue_len(&conn, &self.user_id).ok());
        if let Some(count) = count {
            self.pending.send_replace(count);
        }
    }

    pub(crate) fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct LocalCache {
    pub(crate) inner: Arc<StoreInner>,
}

impl LocalCache {
    pub fn open(path: &Path, user_id: &str) -> Result<Self> {
        Self::open_with_clock(path, user_id, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, user_id: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?, user_id, clock)
    }

    pub fn open_in_memory(user_id: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, user_id, clock)
    }

    fn from_connection(conn: Connection, user_id: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        init_schema(&conn)?;
        let enabled = read_meta(&conn, user_id, META_CLOUD_SYNC)?
            .map(|v| v == "1")
            .unwrap_or(false);
        let pending = outbox::queue_len(&conn, user_id)?;
        let inner = Arc::new(StoreInner {
            conn: Mutex::new(conn),
            user_id: user_id.to_string(),
            clock,
            sync_enabled: AtomicBool::new(enabled),
            pending: watch::Sender::new(pending),
        });
        Ok(Self { inner })
    }

    pub fn outbox(&self) -> Outbox {
        Outbox::new(Arc::clone(&self.inner))
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn cloud_sync_enabled(&self) -> bool {
        self.inner.sync_enabled()
    }

    pub fn set_cloud_sync_enabled(&self, enabled: bool) -> Result<()> {
        {
            let conn = lock_conn(&self.inner)?;
            write_meta(
                &conn,
                &self.inner.user_id,
                META_CLOUD_SYNC,
                if enabled { "1" } else { "0" },
            )?;
        }
        self.inner.sync_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = lock_conn(&self.inner)?;
        let raw = read_meta(&conn, &self.inner.user_id, META_LAST_SYNC)?;
        Ok(raw
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    pub fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        let conn = lock_conn(&self.inner)?;
        write_meta(&conn, &self.inner.user_id, META_LAST_SYNC, &at.to_rfc3339())
    }

    /// Insert a record, assigning a temporary id when the caller does not
    /// provide one. Returns the stored document including id and stamps.
    pub fn insert(&self, table: Table, record: Value) -> Result<Value> {
        let Value::Object(mut fields) = record else {
            return Err(Error::validation("record must be a JSON object"));
        };
        let now = self.inner.clock.now();
        let now_json = serde_json::to_value(now)?;
        let id = fields
            .get("id")
            .and_then(RecordId::from_json)
            .unwrap_or_else(RecordId::fresh_temporary);
        fields.insert("id".to_string(), id.to_json());
        fields
            .entry("createdAt".to_string())
            .or_insert_with(|| now_json.clone());
        fields.insert("updatedAt".to_string(), now_json);
        let record = Value::Object(fields);

        {
            let conn = lock_conn(&self.inner)?;
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, user_id, payload, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    table.as_str()
                ),
                params![
                    id.to_key(),
                    self.inner.user_id,
                    record.to_string(),
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            if self.inner.sync_enabled() {
                let wire = to_wire_row(&record, &self.inner.user_id);
                outbox::push_entry(
                    &conn,
                    &self.inner.user_id,
                    table,
                    Operation::Insert,
                    Some(&id),
                    Some(&wire),
                    now,
                )?;
            }
        }
        self.inner.refresh_pending();
        Ok(record)
    }

    /// Shallow-merge `patch` into an existing record. Returns the merged
    /// document, or `None` when the record does not exist for this user.
    pub fn update(&self, table: Table, id: &RecordId, patch: Value) -> Result<Option<Value>> {
        let Value::Object(patch_fields) = patch else {
            return Err(Error::validation("patch must be a JSON object"));
        };
        let now = self.inner.clock.now();
        let now_json = serde_json::to_value(now)?;

        let merged = {
            let conn = lock_conn(&self.inner)?;
            let Some(mut fields) = load_fields(&conn, table, &self.inner.user_id, id)? else {
                return Ok(None);
            };
            for (key, value) in &patch_fields {
                if key == "id" {
                    continue;
                }
                fields.insert(key.clone(), value.clone());
            }
            fields.insert("updatedAt".to_string(), now_json.clone());
            let merged = Value::Object(fields);
            conn.execute(
                &format!(
                    "UPDATE {} SET payload = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
                    table.as_str()
                ),
                params![merged.to_string(), now.to_rfc3339(), id.to_key(), self.inner.user_id],
            )?;
            if self.inner.sync_enabled() {
                let mut wire_patch = patch_fields;
                wire_patch.insert("updatedAt".to_string(), now_json);
                let wire = to_wire_patch(&Value::Object(wire_patch));
                outbox::push_entry(
                    &conn,
                    &self.inner.user_id,
                    table,
                    Operation::Update,
                    Some(id),
                    Some(&wire),
                    now,
                )?;
            }
            merged
        };
        self.inner.refresh_pending();
        Ok(Some(merged))
    }

    /// Delete a record. Returns whether a row existed.
    pub fn delete(&self, table: Table, id: &RecordId) -> Result<bool> {
        let now = self.inner.clock.now();
        let removed = {
            let conn = lock_conn(&self.inner)?;
            let removed = conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1 AND user_id = ?2", table.as_str()),
                params![id.to_key(), self.inner.user_id],
            )? > 0;
            if removed && self.inner.sync_enabled() {
                outbox::push_entry(
                    &conn,
                    &self.inner.user_id,
                    table,
                    Operation::Delete,
                    Some(id),
                    None,
                    now,
                )?;
            }
            removed
        };
        self.inner.refresh_pending();
        Ok(removed)
    }

    pub fn get_by_id(&self, table: Table, id: &RecordId) -> Result<Option<Value>> {
        let conn = lock_conn(&self.inner)?;
        Ok(load_fields(&conn, table, &self.inner.user_id, id)?.map(Value::Object))
    }

    pub fn get_all(&self, table: Table) -> Result<Vec<Value>> {
        let conn = lock_conn(&self.inner)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT payload FROM {} WHERE user_id = ?1 ORDER BY created_at, id",
            table.as_str()
        ))?;
        let rows = stmt.query_map(params![self.inner.user_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    /// Store a record exactly as given, without stamping or queueing.
    /// Used to absorb rows echoed back or pulled from the remote.
    pub fn put_replacing(&self, table: Table, record: Value) -> Result<Value> {
        let Some(id) = record.get("id").and_then(RecordId::from_json) else {
            return Err(Error::validation("record is missing an id"));
        };
        let created_at = timestamp_or_now(&record, "createdAt", &*self.inner.clock);
        let updated_at = timestamp_or_now(&record, "updatedAt", &*self.inner.clock);
        let conn = lock_conn(&self.inner)?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, user_id, payload, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                table.as_str()
            ),
            params![
                id.to_key(),
                self.inner.user_id,
                record.to_string(),
                created_at,
                updated_at,
            ],
        )?;
        Ok(record)
    }

    /// Wipe one entity table for this user without queueing anything.
    pub fn clear_table(&self, table: Table) -> Result<()> {
        let conn = lock_conn(&self.inner)?;
        conn.execute(
            &format!("DELETE FROM {} WHERE user_id = ?1", table.as_str()),
            params![self.inner.user_id],
        )?;
        Ok(())
    }

    /// Wipe every entity table. The sync queue survives so that pending
    /// offline work still reaches the remote.
    pub fn clear_all(&self) -> Result<()> {
        let conn = lock_conn(&self.inner)?;
        for table in Table::ALL {
            conn.execute(
                &format!("DELETE FROM {} WHERE user_id = ?1", table.as_str()),
                params![self.inner.user_id],
            )?;
        }
        Ok(())
    }

    /// Drop the cached reports locally and queue a scoped bulk delete so
    /// the remote's copies go too.
    pub fn clear_report_cache(&self) -> Result<()> {
        let now = self.inner.clock.now();
        {
            let conn = lock_conn(&self.inner)?;
            conn.execute(
                &format!("DELETE FROM {} WHERE user_id = ?1", Table::ReportCache.as_str()),
                params![self.inner.user_id],
            )?;
            if self.inner.sync_enabled() {
                outbox::push_entry(
                    &conn,
                    &self.inner.user_id,
                    Table::ReportCache,
                    Operation::Delete,
                    None,
                    None,
                    now,
                )?;
            }
        }
        self.inner.refresh_pending();
        Ok(())
    }

    /// Evict everything but the newest `limit` transactions by date.
    /// Eviction is local housekeeping and never reaches the queue.
    pub fn trim_transactions(&self, limit: usize) -> Result<()> {
        let conn = lock_conn(&self.inner)?;
        conn.execute(
            "DELETE FROM transactions WHERE user_id = ?1 AND id NOT IN ( \
                 SELECT id FROM transactions WHERE user_id = ?1 \
                 ORDER BY json_extract(payload, '$.date') DESC, created_at DESC \
                 LIMIT ?2)",
            params![self.inner.user_id, limit as i64],
        )?;
        Ok(())
    }

    /// Apply signed balance deltas to accounts. Unknown accounts are
    /// skipped so a half-referenced transaction cannot poison the batch.
    pub fn apply_balance_deltas(&self, deltas: &[(RecordId, Decimal)]) -> Result<()> {
        for (account_id, delta) in deltas {
            let now = self.inner.clock.now();
            let now_json = serde_json::to_value(now)?;
            {
                let conn = lock_conn(&self.inner)?;
                let Some(mut fields) =
                    load_fields(&conn, Table::Accounts, &self.inner.user_id, account_id)?
                else {
                    continue;
                };
                let balance = decimal_field(&fields, "balance") + *delta;
                fields.insert("balance".to_string(), serde_json::to_value(balance)?);
                fields.insert("updatedAt".to_string(), now_json.clone());
                let updated = Value::Object(fields);
                conn.execute(
                    "UPDATE accounts SET payload = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND user_id = ?4",
                    params![updated.to_string(), now.to_rfc3339(), account_id.to_key(), self.inner.user_id],
                )?;
                if self.inner.sync_enabled() {
                    let wire = serde_json::json!({
                        "balance": updated.get("balance"),
                        "updated_at": now_json,
                    });
                    outbox::push_entry(
                        &conn,
                        &self.inner.user_id,
                        Table::Accounts,
                        Operation::Update,
                        Some(account_id),
                        Some(&wire),
                        now,
                    )?;
                }
            }
        }
        self.inner.refresh_pending();
        Ok(())
    }

    /// Fold a signed payment amount into a loan's `paidAmount` and
    /// re-derive its status. A missing loan is a silent no-op.
    pub fn record_loan_payment(&self, loan_id: &RecordId, amount: Decimal) -> Result<()> {
        let now = self.inner.clock.now();
        let now_json = serde_json::to_value(now)?;
        {
            let conn = lock_conn(&self.inner)?;
            let Some(mut fields) = load_fields(&conn, Table::Loans, &self.inner.user_id, loan_id)?
            else {
                return Ok(());
            };
            let principal = decimal_field(&fields, "amount");
            let paid = decimal_field(&fields, "paidAmount") + amount;
            let status = if paid >= principal {
                "fully_paid"
            } else if paid > Decimal::ZERO {
                "partially_paid"
            } else {
                "active"
            };
            fields.insert("paidAmount".to_string(), serde_json::to_value(paid)?);
            fields.insert("status".to_string(), Value::from(status));
            fields.insert("updatedAt".to_string(), now_json.clone());
            let updated = Value::Object(fields);
            conn.execute(
                "UPDATE loans SET payload = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
                params![updated.to_string(), now.to_rfc3339(), loan_id.to_key(), self.inner.user_id],
            )?;
            if self.inner.sync_enabled() {
                let wire = serde_json::json!({
                    "paid_amount": updated.get("paidAmount"),
                    "status": status,
                    "updated_at": now_json,
                });
                outbox::push_entry(
                    &conn,
                    &self.inner.user_id,
                    Table::Loans,
                    Operation::Update,
                    Some(loan_id),
                    Some(&wire),
                    now,
                )?;
            }
        }
        self.inner.refresh_pending();
        Ok(())
    }

    /// Undo a previously recorded payment.
    pub fn reverse_loan_payment(&self, loan_id: &RecordId, amount: Decimal) -> Result<()> {
        self.record_loan_payment(loan_id, -amount)
    }

    /// Persist the outcome of [`crate::ledger::apply`] or
    /// [`crate::ledger::reverse`] in one call.
    pub fn commit_effect(&self, effect: &LedgerEffect) -> Result<()> {
        self.apply_balance_deltas(&effect.account_deltas)?;
        if let Some(payment) = &effect.loan_payment {
            self.record_loan_payment(&payment.loan_id, payment.amount)?;
        }
        Ok(())
    }

    /// Swap a temporary id for the permanent one the remote assigned.
    /// The record's own row, every cached reference to it and every
    /// pending queue entry move together under one lock.
    pub(crate) fn rewrite_record_id(
        &self,
        table: Table,
        old: &RecordId,
        new: &RecordId,
    ) -> Result<()> {
        let conn = lock_conn(&self.inner)?;

        let stamps: Option<(String, String)> = conn
            .query_row(
                &format!(
                    "SELECT created_at, updated_at FROM {} WHERE id = ?1 AND user_id = ?2",
                    table.as_str()
                ),
                params![old.to_key(), self.inner.user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((created_at, updated_at)) = stamps {
            if let Some(mut fields) = load_fields(&conn, table, &self.inner.user_id, old)? {
                fields.insert("id".to_string(), new.to_json());
                let payload = Value::Object(fields);
                conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?1 AND user_id = ?2", table.as_str()),
                    params![old.to_key(), self.inner.user_id],
                )?;
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {} (id, user_id, payload, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        table.as_str()
                    ),
                    params![
                        new.to_key(),
                        self.inner.user_id,
                        payload.to_string(),
                        created_at,
                        updated_at,
                    ],
                )?;
            }
        }

        for (ref_table, field) in table.referencing_fields() {
            let rows: Vec<(String, String)> = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, payload FROM {} WHERE user_id = ?1",
                    ref_table.as_str()
                ))?;
                let mapped = stmt.query_map(params![self.inner.user_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                mapped.collect::<std::result::Result<_, _>>()?
            };
            for (row_id, raw) in rows {
                let mut payload: Value = serde_json::from_str(&raw)?;
                if payload.get(*field) == Some(&old.to_json()) {
                    payload[*field] = new.to_json();
                    conn.execute(
                        &format!(
                            "UPDATE {} SET payload = ?1 WHERE id = ?2 AND user_id = ?3",
                            ref_table.as_str()
                        ),
                        params![payload.to_string(), row_id, self.inner.user_id],
                    )?;
                }
            }
        }

        outbox::rewrite_references(&conn, &self.inner.user_id, old, new)?;
        Ok(())
    }
}

pub(crate) fn lock_conn(inner: &StoreInner) -> Result<std::sync::MutexGuard<'_, Connection>> {
    inner
        .conn
        .lock()
        .map_err(|_| Error::transient("local store lock poisoned"))
}

fn init_schema(conn: &Connection) -> Result<()> {
    let mut ddl = String::new();
    for table in Table::ALL {
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {} ( \
                 id TEXT NOT NULL, \
                 user_id TEXT NOT NULL, \
                 payload TEXT NOT NULL, \
                 created_at TEXT NOT NULL, \
                 updated_at TEXT NOT NULL, \
                 PRIMARY KEY (id, user_id) \
             );\n",
            table.as_str()
        ));
    }
    ddl.push_str(
        "CREATE TABLE IF NOT EXISTS sync_queue ( \
             seq INTEGER PRIMARY KEY AUTOINCREMENT, \
             user_id TEXT NOT NULL, \
             tbl TEXT NOT NULL, \
             op TEXT NOT NULL, \
             record_id TEXT, \
             payload TEXT, \
             attempts INTEGER NOT NULL DEFAULT 0, \
             last_error TEXT, \
             created_at TEXT NOT NULL \
         );\n\
         CREATE TABLE IF NOT EXISTS meta ( \
             user_id TEXT NOT NULL, \
             key TEXT NOT NULL, \
             value TEXT NOT NULL, \
             PRIMARY KEY (user_id, key) \
         );\n",
    );
    conn.execute_batch(&ddl)?;
    Ok(())
}

fn read_meta(conn: &Connection, user_id: &str, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM meta WHERE user_id = ?1 AND key = ?2",
            params![user_id, key],
            |row| row.get(0),
        )
        .optional()?)
}

fn write_meta(conn: &Connection, user_id: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (user_id, key, value) VALUES (?1, ?2, ?3)",
        params![user_id, key, value],
    )?;
    Ok(())
}

fn load_fields(
    conn: &Connection,
    table: Table,
    user_id: &str,
    id: &RecordId,
) -> Result<Option<Map<String, Value>>> {
    let raw: Option<String> = conn
        .query_row(
            &format!(
                "SELECT payload FROM {} WHERE id = ?1 AND user_id = ?2",
                table.as_str()
            ),
            params![id.to_key(), user_id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => match serde_json::from_str(&raw)? {
            Value::Object(fields) => Ok(Some(fields)),
            _ => Ok(None),
        },
        None => Ok(None),
    }
}

fn decimal_field(fields: &Map<String, Value>, key: &str) -> Decimal {
    fields
        .get(key)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(Decimal::ZERO)
}

fn timestamp_or_now(record: &Value, key: &str, clock: &dyn Clock) -> String {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| clock.now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FixedClock;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn cache() -> LocalCache {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap(),
        ));
        LocalCache::open_in_memory("user-1", clock).unwrap()
    }

    #[test]
    fn insert_assigns_a_temporary_id_and_stamps() {
        let cache = cache();
        let stored = cache
            .insert(Table::Accounts, json!({"name": "Cash", "balance": 0}))
            .unwrap();
        let id = RecordId::from_json(&stored["id"]).unwrap();
        assert!(id.is_temporary());
        assert!(stored["createdAt"].is_string());
        assert_eq!(stored["createdAt"], stored["updatedAt"]);
    }

    #[test]
    fn mutations_queue_only_when_cloud_sync_is_enabled() {
        let cache = cache();
        cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        assert_eq!(cache.outbox().count().unwrap(), 0);

        cache.set_cloud_sync_enabled(true).unwrap();
        let stored = cache.insert(Table::Accounts, json!({"name": "B"})).unwrap();
        let entries = cache.outbox().peek_batch(10).unwrap();
        assert_eq!(entries.len(), 1);
        let payload = entries[0].payload.as_ref().unwrap();
        assert_eq!(payload["name"], json!("B"));
        assert_eq!(payload["user_id"], json!("user-1"));
        assert!(payload.get("id").is_none());
        assert_eq!(
            entries[0].record_id,
            RecordId::from_json(&stored["id"])
        );
    }

    #[test]
    fn update_merges_and_misses_return_none() {
        let cache = cache();
        let stored = cache
            .insert(Table::Categories, json!({"name": "Food", "color": "#f00"}))
            .unwrap();
        let id = RecordId::from_json(&stored["id"]).unwrap();

        let merged = cache
            .update(Table::Categories, &id, json!({"name": "Groceries"}))
            .unwrap()
            .unwrap();
        assert_eq!(merged["name"], json!("Groceries"));
        assert_eq!(merged["color"], json!("#f00"));

        let missing = cache
            .update(Table::Categories, &RecordId::Permanent(404), json!({"name": "x"}))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn delete_reports_whether_a_row_existed() {
        let cache = cache();
        let stored = cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        let id = RecordId::from_json(&stored["id"]).unwrap();
        assert!(cache.delete(Table::Accounts, &id).unwrap());
        assert!(!cache.delete(Table::Accounts, &id).unwrap());
    }

    #[test]
    fn clear_all_spares_the_sync_queue() {
        let cache = cache();
        cache.set_cloud_sync_enabled(true).unwrap();
        cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        assert_eq!(cache.outbox().count().unwrap(), 1);

        cache.clear_all().unwrap();
        assert!(cache.get_all(Table::Accounts).unwrap().is_empty());
        assert_eq!(cache.outbox().count().unwrap(), 1);
    }

    #[test]
    fn clear_report_cache_queues_a_scoped_bulk_delete() {
        let cache = cache();
        cache.set_cloud_sync_enabled(true).unwrap();
        cache
            .put_replacing(Table::ReportCache, json!({"id": 1, "report": "net_worth"}))
            .unwrap();
        cache.clear_report_cache().unwrap();

        assert!(cache.get_all(Table::ReportCache).unwrap().is_empty());
        let entries = cache.outbox().peek_batch(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].op, Operation::Delete);
        assert!(entries[0].record_id.is_none());
    }

    #[test]
    fn trim_keeps_the_newest_transactions_by_date() {
        let cache = cache();
        for day in 1..=5 {
            cache
                .insert(
                    Table::Transactions,
                    json!({
                        "type": "expense",
                        "amount": 10,
                        "date": format!("2026-03-{day:02}T12:00:00Z"),
                    }),
                )
                .unwrap();
        }
        cache.trim_transactions(2).unwrap();

        let remaining = cache.get_all(Table::Transactions).unwrap();
        assert_eq!(remaining.len(), 2);
        let mut dates: Vec<&str> = remaining
            .iter()
            .map(|r| r["date"].as_str().unwrap())
            .collect();
        dates.sort();
        assert_eq!(dates, vec!["2026-03-04T12:00:00Z", "2026-03-05T12:00:00Z"]);
    }

    #[test]
    fn balance_deltas_adjust_accounts_and_skip_unknown_ones() {
        let cache = cache();
        let account = cache
            .insert(Table::Accounts, json!({"name": "A", "balance": 100}))
            .unwrap();
        let id = RecordId::from_json(&account["id"]).unwrap();

        cache
            .apply_balance_deltas(&[
                (id.clone(), dec!(-30)),
                (RecordId::Permanent(404), dec!(1000)),
            ])
            .unwrap();

        let updated = cache.get_by_id(Table::Accounts, &id).unwrap().unwrap();
        let balance: Decimal = serde_json::from_value(updated["balance"].clone()).unwrap();
        assert_eq!(balance, dec!(70));
    }

    #[test]
    fn loan_payment_updates_paid_amount_and_status() {
        let cache = cache();
        let loan = cache
            .insert(
                Table::Loans,
                json!({"type": "given", "amount": 100, "paidAmount": 0, "status": "active"}),
            )
            .unwrap();
        let id = RecordId::from_json(&loan["id"]).unwrap();

        cache.record_loan_payment(&id, dec!(40)).unwrap();
        let after = cache.get_by_id(Table::Loans, &id).unwrap().unwrap();
        assert_eq!(after["status"], json!("partially_paid"));

        cache.record_loan_payment(&id, dec!(60)).unwrap();
        let after = cache.get_by_id(Table::Loans, &id).unwrap().unwrap();
        assert_eq!(after["status"], json!("fully_paid"));

        cache.record_loan_payment(&id, dec!(-100)).unwrap();
        let after = cache.get_by_id(Table::Loans, &id).unwrap().unwrap();
        assert_eq!(after["status"], json!("active"));

        // unknown loan is a no-op
        cache
            .record_loan_payment(&RecordId::Permanent(404), dec!(10))
            .unwrap();
    }

    #[test]
    fn rewriting_an_id_updates_references_and_queue_payloads() {
        let cache = cache();
        cache.set_cloud_sync_enabled(true).unwrap();
        let account = cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        let temp = RecordId::from_json(&account["id"]).unwrap();
        let tx = cache
            .insert(
                Table::Transactions,
                json!({"type": "expense", "amount": 5, "accountId": temp.to_json(), "date": "2026-03-10T09:00:00Z"}),
            )
            .unwrap();
        let tx_id = RecordId::from_json(&tx["id"]).unwrap();

        cache
            .rewrite_record_id(Table::Accounts, &temp, &RecordId::Permanent(77))
            .unwrap();

        assert!(cache.get_by_id(Table::Accounts, &temp).unwrap().is_none());
        let moved = cache
            .get_by_id(Table::Accounts, &RecordId::Permanent(77))
            .unwrap()
            .unwrap();
        assert_eq!(moved["id"], json!(77));

        let tx_after = cache.get_by_id(Table::Transactions, &tx_id).unwrap().unwrap();
        assert_eq!(tx_after["accountId"], json!(77));

        let entries = cache.outbox().peek_batch(10).unwrap();
        let tx_entry = entries
            .iter()
            .find(|e| e.table == Table::Transactions)
            .unwrap();
        assert_eq!(tx_entry.payload.as_ref().unwrap()["account_id"], json!(77));
        let account_entry = entries.iter().find(|e| e.table == Table::Accounts).unwrap();
        assert_eq!(account_entry.record_id, Some(RecordId::Permanent(77)));
    }

    #[test]
    fn settings_survive_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pouch.db");
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap(),
        ));
        {
            let cache = LocalCache::open_with_clock(&path, "user-1", clock.clone()).unwrap();
            cache.set_cloud_sync_enabled(true).unwrap();
            cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        }
        let reopened = LocalCache::open_with_clock(&path, "user-1", clock).unwrap();
        assert!(reopened.cloud_sync_enabled());
        assert_eq!(reopened.outbox().count().unwrap(), 1);
        assert_eq!(reopened.get_all(Table::Accounts).unwrap().len(), 1);
    }
}
