//! Ordered durable queue of local mutations awaiting remote replay.
//!
//! Entries share the cache's sqlite file so an interrupted process never
//! loses acknowledged-locally work. The queue is strictly FIFO by `seq`;
//! the sync engine owns consumption and the coalescing of entries that
//! target the same record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::cache::{lock_conn, StoreInner};
use crate::errors::{Error, Result};
use crate::model::{RecordId, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One queued mutation. `record_id` is `None` for scoped bulk deletes;
/// `payload` carries the wire-shaped row or patch for writes.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub seq: i64,
    pub table: Table,
    pub op: Operation,
    pub record_id: Option<RecordId>,
    pub payload: Option<Value>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: String,
}

#[derive(Clone)]
pub struct Outbox {
    inner: Arc<StoreInner>,
}

impl Outbox {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn count(&self) -> Result<usize> {
        let conn = lock_conn(&self.inner)?;
        queue_len(&conn, &self.inner.user_id)
    }

    /// Oldest pending entries in enqueue order.
    pub fn peek_batch(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = lock_conn(&self.inner)?;
        let mut stmt = conn.prepare(
            "SELECT seq, tbl, op, record_id, payload, attempts, last_error, created_at \
             FROM sync_queue WHERE user_id = ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![self.inner.user_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, tbl, op, record_id, payload, attempts, last_error, created_at) = row?;
            let payload = match payload {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            };
            out.push(OutboxEntry {
                seq,
                table: tag_from_db(&tbl)?,
                op: tag_from_db(&op)?,
                record_id: record_id.as_deref().map(RecordId::from_key),
                payload,
                attempts,
                last_error,
                created_at,
            });
        }
        Ok(out)
    }

    /// Drop acknowledged entries.
    pub fn remove(&self, seqs: &[i64]) -> Result<()> {
        {
            let conn = lock_conn(&self.inner)?;
            for seq in seqs {
                conn.execute(
                    "DELETE FROM sync_queue WHERE user_id = ?1 AND seq = ?2",
                    params![self.inner.user_id, seq],
                )?;
            }
        }
        self.inner.refresh_pending();
        Ok(())
    }

    /// Note a failed replay attempt, keeping the entry for a later cycle.
    pub fn record_failure(&self, seq: i64, message: &str) -> Result<i64> {
        let conn = lock_conn(&self.inner)?;
        conn.execute(
            "UPDATE sync_queue SET attempts = attempts + 1, last_error = ?3 \
             WHERE user_id = ?1 AND seq = ?2",
            params![self.inner.user_id, seq, message],
        )?;
        conn.query_row(
            "SELECT attempts FROM sync_queue WHERE user_id = ?1 AND seq = ?2",
            params![self.inner.user_id, seq],
            |row| row.get(0),
        )
        .map_err(Error::from)
    }

    /// Drop every entry that targets or references `id`. Used when an
    /// insert is permanently rejected: anything built on its temporary
    /// id can never replay either.
    pub fn remove_referencing(&self, id: &RecordId) -> Result<usize> {
        let removed = {
            let conn = lock_conn(&self.inner)?;
            let mut doomed: Vec<i64> = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT seq, record_id, payload FROM sync_queue WHERE user_id = ?1",
                )?;
                let rows = stmt.query_map(params![self.inner.user_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (seq, record_id, payload) = row?;
                    let hit = record_id.as_deref() == Some(id.to_key().as_str())
                        || payload
                            .as_deref()
                            .map(|raw| payload_references(raw, id))
                            .unwrap_or(false);
                    if hit {
                        doomed.push(seq);
                    }
                }
            }
            for seq in &doomed {
                conn.execute(
                    "DELETE FROM sync_queue WHERE user_id = ?1 AND seq = ?2",
                    params![self.inner.user_id, seq],
                )?;
            }
            doomed.len()
        };
        self.inner.refresh_pending();
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        {
            let conn = lock_conn(&self.inner)?;
            conn.execute(
                "DELETE FROM sync_queue WHERE user_id = ?1",
                params![self.inner.user_id],
            )?;
        }
        self.inner.refresh_pending();
        Ok(())
    }

    /// Watch the queue depth. The receiver holds the latest count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.inner.pending.subscribe()
    }

    /// Block until the queue is empty or the deadline passes.
    pub async fn wait_until_drained(&self, deadline: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        tokio::time::timeout(deadline, async move {
            loop {
                if *rx.borrow_and_update() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)
    }
}

pub(crate) fn queue_len(conn: &Connection, user_id: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

pub(crate) fn push_entry(
    conn: &Connection,
    user_id: &str,
    table: Table,
    op: Operation,
    record_id: Option<&RecordId>,
    payload: Option<&Value>,
    created_at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO sync_queue (user_id, tbl, op, record_id, payload, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            table.as_str(),
            tag_to_db(&op)?,
            record_id.map(RecordId::to_key),
            payload.map(Value::to_string),
            created_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Point pending entries at a record's new permanent id, both where the
/// entry targets the record and where its payload references it.
pub(crate) fn rewrite_references(
    conn: &Connection,
    user_id: &str,
    old: &RecordId,
    new: &RecordId,
) -> Result<()> {
    conn.execute(
        "UPDATE sync_queue SET record_id = ?3 WHERE user_id = ?1 AND record_id = ?2",
        params![user_id, old.to_key(), new.to_key()],
    )?;

    let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(
            "SELECT seq, payload FROM sync_queue WHERE user_id = ?1 AND payload IS NOT NULL",
        )?;
        let mapped = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        mapped.collect::<std::result::Result<_, _>>()?
    };
    for (seq, raw) in rows {
        if !payload_references(&raw, old) {
            continue;
        }
        let mut payload: Value = serde_json::from_str(&raw)?;
        if let Value::Object(fields) = &mut payload {
            for value in fields.values_mut() {
                if *value == old.to_json() {
                    *value = new.to_json();
                }
            }
        }
        conn.execute(
            "UPDATE sync_queue SET payload = ?3 WHERE user_id = ?1 AND seq = ?2",
            params![user_id, seq, payload.to_string()],
        )?;
    }
    Ok(())
}

// Temporary ids embed a UUID, so a raw substring probe cannot collide
// with unrelated field values.
fn payload_references(raw: &str, id: &RecordId) -> bool {
    match id {
        RecordId::Temporary(key) => raw.contains(key.as_str()),
        RecordId::Permanent(_) => false,
    }
}

fn tag_to_db<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

fn tag_from_db<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{raw}\""))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::runtime::FixedClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn cache() -> LocalCache {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap(),
        ));
        let cache = LocalCache::open_in_memory("user-1", clock).unwrap();
        cache.set_cloud_sync_enabled(true).unwrap();
        cache
    }

    #[test]
    fn entries_come_back_in_enqueue_order() {
        let cache = cache();
        let a = cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        let id = RecordId::from_json(&a["id"]).unwrap();
        cache
            .update(Table::Accounts, &id, json!({"name": "A2"}))
            .unwrap();
        cache.delete(Table::Accounts, &id).unwrap();

        let entries = cache.outbox().peek_batch(10).unwrap();
        let ops: Vec<Operation> = entries.iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            vec![Operation::Insert, Operation::Update, Operation::Delete]
        );
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn remove_and_failure_bookkeeping() {
        let cache = cache();
        cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        let outbox = cache.outbox();
        let entry = &outbox.peek_batch(1).unwrap()[0];

        assert_eq!(outbox.record_failure(entry.seq, "boom").unwrap(), 1);
        assert_eq!(outbox.record_failure(entry.seq, "boom").unwrap(), 2);
        let entry = &outbox.peek_batch(1).unwrap()[0];
        assert_eq!(entry.last_error.as_deref(), Some("boom"));

        outbox.remove(&[entry.seq]).unwrap();
        assert_eq!(outbox.count().unwrap(), 0);
    }

    #[test]
    fn remove_referencing_takes_dependents_with_it() {
        let cache = cache();
        let account = cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        let temp = RecordId::from_json(&account["id"]).unwrap();
        cache
            .insert(
                Table::Transactions,
                json!({"type": "expense", "amount": 5, "accountId": temp.to_json(), "date": "2026-03-10T00:00:00Z"}),
            )
            .unwrap();
        cache.insert(Table::Categories, json!({"name": "Food"})).unwrap();
        assert_eq!(cache.outbox().count().unwrap(), 3);

        let removed = cache.outbox().remove_referencing(&temp).unwrap();
        assert_eq!(removed, 2);
        let left = cache.outbox().peek_batch(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].table, Table::Categories);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_drained_resolves_when_the_queue_empties() {
        let cache = cache();
        cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        let outbox = cache.outbox();
        let seq = outbox.peek_batch(1).unwrap()[0].seq;

        let waiter = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.wait_until_drained(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        outbox.remove(&[seq]).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_drained_times_out() {
        let cache = cache();
        cache.insert(Table::Accounts, json!({"name": "A"})).unwrap();
        let err = cache
            .outbox()
            .wait_until_drained(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}
