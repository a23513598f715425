//! Drains the outbox into the remote store and reconciles temporary ids.
//!
//! The engine runs one cycle at a time. A cycle coalesces queue entries
//! that target the same not-yet-acknowledged record, then replays the
//! rest strictly in enqueue order so nothing is sent before the insert
//! it depends on is acknowledged. Transient failures stop the cycle with
//! everything left in place; payload rejections drop the entry together
//! with anything referencing its temporary id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::cache::{LocalCache, TRANSACTION_CACHE_LIMIT};
use crate::errors::{Error, Result};
use crate::model::{from_wire_row, RecordId, Table};
use crate::outbox::{Operation, Outbox, OutboxEntry};
use crate::runtime::{Clock, Connectivity};
use crate::sync::RemoteStore;

/// Entries considered per drain pass.
const MAX_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error,
}

/// Snapshot of the engine for status surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub pending: usize,
    pub offline: bool,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

pub struct SyncEngine {
    cache: LocalCache,
    outbox: Outbox,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    status: Mutex<(SyncStatus, Option<String>)>,
    syncing: AtomicBool,
}

#[derive(Debug, Clone)]
struct InsertItem {
    table: Table,
    temp: RecordId,
    payload: Value,
    seqs: Vec<i64>,
}

#[derive(Debug, Clone)]
enum PlanItem {
    Insert(InsertItem),
    Update {
        table: Table,
        seq: i64,
        id: RecordId,
        payload: Value,
    },
    Delete {
        table: Table,
        seq: i64,
        id: Option<RecordId>,
    },
}

enum BatchOutcome {
    Applied(Vec<(RecordId, RecordId)>),
    Rejected(Vec<RecordId>),
}

impl SyncEngine {
    pub fn new(
        cache: LocalCache,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let outbox = cache.outbox();
        let clock = Arc::clone(&cache.inner.clock);
        Self {
            cache,
            outbox,
            remote,
            connectivity,
            clock,
            status: Mutex::new((SyncStatus::Idle, None)),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SyncState {
        let (status, last_error) = self
            .status
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or((SyncStatus::Error, Some("status lock poisoned".to_string())));
        SyncState {
            status,
            pending: self.outbox.count().unwrap_or(0),
            offline: !self.connectivity.is_online(),
            last_error,
            last_sync_at: self.cache.last_sync_at().unwrap_or(None),
        }
    }

    /// Terminal states yield back to idle on the next local mutation.
    pub fn note_local_mutation(&self) {
        if let Ok(mut slot) = self.status.lock() {
            if matches!(slot.0, SyncStatus::Success | SyncStatus::Error) {
                *slot = (SyncStatus::Idle, None);
            }
        }
    }

    /// Connectivity returned; push whatever accumulated while offline.
    pub async fn handle_online(&self) -> Result<()> {
        if self.outbox.count()? > 0 {
            self.sync_all().await
        } else {
            Ok(())
        }
    }

    /// Replay the full queue against the remote. A no-op when cloud sync
    /// is disabled, the device is offline or a cycle is already running.
    pub async fn sync_all(&self) -> Result<()> {
        if !self.cache.cloud_sync_enabled() || !self.connectivity.is_online() {
            return Ok(());
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_status(SyncStatus::Syncing, None);

        let result = self.drain().await;
        match &result {
            Ok(()) => {
                let now = self.clock.now();
                if let Err(err) = self.cache.set_last_sync_at(now) {
                    log::warn!("failed to record sync completion time: {err}");
                }
                if let Err(err) = self.remote.prune_expired_reports(now).await {
                    log::debug!("skipping expired report prune: {err}");
                }
                self.set_status(SyncStatus::Success, None);
            }
            Err(err) => {
                log::warn!("sync cycle stopped: {err}");
                self.set_status(SyncStatus::Error, Some(err.to_string()));
            }
        }

        self.syncing.store(false, Ordering::SeqCst);
        result
    }

    /// Replace the local cache with the remote's current state. Used on
    /// first unlock of cloud sync and for manual refresh.
    pub async fn pull_from_remote(&self) -> Result<()> {
        if !self.cache.cloud_sync_enabled() || !self.connectivity.is_online() {
            return Ok(());
        }
        for table in Table::ALL {
            let rows = self.remote.list(table).await?;
            self.cache.clear_table(table)?;
            for row in rows {
                self.cache.put_replacing(table, from_wire_row(&row))?;
            }
        }
        self.cache.trim_transactions(TRANSACTION_CACHE_LIMIT)?;
        self.cache.set_last_sync_at(self.clock.now())?;
        Ok(())
    }

    fn set_status(&self, status: SyncStatus, last_error: Option<String>) {
        if let Ok(mut slot) = self.status.lock() {
            *slot = (status, last_error);
        }
    }

    async fn drain(&self) -> Result<()> {
        loop {
            let entries = self.outbox.peek_batch(MAX_BATCH)?;
            if entries.is_empty() {
                return Ok(());
            }
            let before = self.outbox.count()?;
            self.run_pass(entries).await?;
            // Progress guard: a healthy pass always shrinks the queue.
            if self.outbox.count()? >= before {
                return Ok(());
            }
        }
    }

    async fn run_pass(&self, entries: Vec<OutboxEntry>) -> Result<()> {
        let (mut plan, annihilated) = build_plan(entries);
        if !annihilated.is_empty() {
            log::debug!("coalescing removed {} queue entries", annihilated.len());
            self.outbox.remove(&annihilated)?;
        }

        let mut dropped: HashSet<String> = HashSet::new();
        let mut i = 0;
        while i < plan.len() {
            if references_any(&plan[i], &dropped) {
                i += 1;
                continue;
            }

            // Consecutive transaction creates go out as one request.
            if is_transaction_insert(&plan[i]) {
                let mut j = i;
                while j < plan.len()
                    && is_transaction_insert(&plan[j])
                    && !references_any(&plan[j], &dropped)
                {
                    j += 1;
                }
                if j - i > 1 {
                    let mut rows = Vec::with_capacity(j - i);
                    let mut metas = Vec::with_capacity(j - i);
                    for item in plan[i..j].iter() {
                        if let PlanItem::Insert(it) = item {
                            rows.push(it.payload.clone());
                            metas.push((it.temp.clone(), it.seqs.clone()));
                        }
                    }
                    match self.push_transaction_batch(rows, metas).await? {
                        BatchOutcome::Applied(mappings) => {
                            for (temp, perm) in &mappings {
                                rewrite_plan(&mut plan[j..], temp, perm);
                            }
                        }
                        BatchOutcome::Rejected(temps) => {
                            for temp in temps {
                                dropped.insert(temp.to_key());
                            }
                        }
                    }
                    i = j;
                    continue;
                }
            }

            let item = plan[i].clone();
            match item {
                PlanItem::Insert(item) => {
                    self.push_single_insert(&mut plan, i, item, &mut dropped).await?;
                }
                PlanItem::Update { table, seq, id, payload } => {
                    self.push_update(table, seq, id, payload).await?;
                }
                PlanItem::Delete { table, seq, id } => {
                    self.push_delete(table, seq, id).await?;
                }
            }
            i += 1;
        }
        Ok(())
    }

    async fn push_single_insert(
        &self,
        plan: &mut [PlanItem],
        idx: usize,
        item: InsertItem,
        dropped: &mut HashSet<String>,
    ) -> Result<()> {
        let tx_date = (item.table == Table::Transactions)
            .then(|| wire_date(&item.payload))
            .flatten();
        match self.remote.insert(item.table, item.payload).await {
            Ok(row) => {
                let perm = self.reconcile_insert(item.table, &item.temp, &row)?;
                rewrite_plan(&mut plan[idx + 1..], &item.temp, &perm);
                self.outbox.remove(&item.seqs)?;
                self.invalidate_reports_after(tx_date).await;
                Ok(())
            }
            Err(err) if matches!(err, Error::Validation(_)) => {
                log::warn!(
                    "{} insert rejected, dropping entry and dependents: {err}",
                    item.table
                );
                self.outbox.remove(&item.seqs)?;
                self.outbox.remove_referencing(&item.temp)?;
                dropped.insert(item.temp.to_key());
                Ok(())
            }
            Err(err) => {
                self.outbox.record_failure(item.seqs[0], &err.to_string())?;
                Err(err)
            }
        }
    }

    async fn push_transaction_batch(
        &self,
        rows: Vec<Value>,
        metas: Vec<(RecordId, Vec<i64>)>,
    ) -> Result<BatchOutcome> {
        let earliest = rows.iter().filter_map(wire_date).min();
        match self.remote.insert_many(Table::Transactions, rows).await {
            Ok(echoed) if echoed.len() == metas.len() => {
                let mut mappings = Vec::with_capacity(metas.len());
                for ((temp, seqs), row) in metas.into_iter().zip(echoed) {
                    let perm = self.reconcile_insert(Table::Transactions, &temp, &row)?;
                    self.outbox.remove(&seqs)?;
                    mappings.push((temp, perm));
                }
                self.invalidate_reports_after(earliest).await;
                Ok(BatchOutcome::Applied(mappings))
            }
            Ok(echoed) => {
                log::warn!(
                    "bulk insert echoed {} rows for {} sent, dropping batch",
                    echoed.len(),
                    metas.len()
                );
                self.reject_batch(metas).map(BatchOutcome::Rejected)
            }
            Err(err) if matches!(err, Error::Validation(_)) => {
                log::warn!("bulk transaction insert rejected, dropping batch: {err}");
                self.reject_batch(metas).map(BatchOutcome::Rejected)
            }
            Err(err) => {
                if let Some((_, seqs)) = metas.first() {
                    self.outbox.record_failure(seqs[0], &err.to_string())?;
                }
                Err(err)
            }
        }
    }

    fn reject_batch(&self, metas: Vec<(RecordId, Vec<i64>)>) -> Result<Vec<RecordId>> {
        let mut temps = Vec::with_capacity(metas.len());
        for (temp, seqs) in metas {
            self.outbox.remove(&seqs)?;
            self.outbox.remove_referencing(&temp)?;
            temps.push(temp);
        }
        Ok(temps)
    }

    async fn push_update(
        &self,
        table: Table,
        seq: i64,
        id: RecordId,
        payload: Value,
    ) -> Result<()> {
        let Some(remote_id) = id.as_permanent() else {
            // The insert this update depended on is gone.
            log::warn!("dropping orphaned {table} update targeting {id}");
            self.outbox.remove(&[seq])?;
            return Ok(());
        };
        let tx_date = (table == Table::Transactions)
            .then(|| wire_date(&payload))
            .flatten();
        match self.remote.update(table, remote_id, payload).await {
            Ok(_) => {
                self.invalidate_reports_after(tx_date).await;
                self.outbox.remove(&[seq])
            }
            Err(Error::NotFound) => {
                log::info!("{table} row {remote_id} gone remotely, update already moot");
                self.outbox.remove(&[seq])
            }
            Err(err) if matches!(err, Error::Validation(_)) => {
                log::warn!("{table} update for {remote_id} rejected, dropping: {err}");
                self.outbox.remove(&[seq])
            }
            Err(err) => {
                self.outbox.record_failure(seq, &err.to_string())?;
                Err(err)
            }
        }
    }

    async fn push_delete(&self, table: Table, seq: i64, id: Option<RecordId>) -> Result<()> {
        let result = match id.as_ref().and_then(RecordId::as_permanent) {
            Some(remote_id) => self.remote.delete(table, remote_id).await,
            None => self.remote.delete_all(table).await,
        };
        match result {
            Ok(()) => self.outbox.remove(&[seq]),
            Err(Error::NotFound) => {
                log::info!("{table} delete target already gone remotely");
                self.outbox.remove(&[seq])
            }
            Err(err) if matches!(err, Error::Validation(_)) => {
                log::warn!("{table} delete rejected, dropping: {err}");
                self.outbox.remove(&[seq])
            }
            Err(err) => {
                self.outbox.record_failure(seq, &err.to_string())?;
                Err(err)
            }
        }
    }

    /// Cached report rows covering `date` or later went stale the moment
    /// a transaction landed there. The write itself already succeeded,
    /// so a failure here only leaves stale report rows behind.
    async fn invalidate_reports_after(&self, date: Option<DateTime<Utc>>) {
        let Some(date) = date else { return };
        if let Err(err) = self.remote.invalidate_report_periods(date).await {
            log::warn!("failed to invalidate cached reports from {date}: {err}");
        }
    }

    /// Absorb the acknowledged row: swap the temporary id everywhere and
    /// store the remote's echo with its server-side stamps.
    fn reconcile_insert(&self, table: Table, temp: &RecordId, row: &Value) -> Result<RecordId> {
        let Some(new_id) = row.get("id").and_then(Value::as_i64) else {
            return Err(Error::validation("insert response is missing a numeric id"));
        };
        let perm = RecordId::Permanent(new_id);
        if temp.is_temporary() {
            self.cache.rewrite_record_id(table, temp, &perm)?;
        }
        self.cache.put_replacing(table, from_wire_row(row))?;
        Ok(perm)
    }
}

/// Fold the raw queue into a replay plan. Entries that target the same
/// unacknowledged record collapse: updates merge into the pending
/// insert, a delete annihilates the whole chain before it ever leaves
/// the device.
fn build_plan(entries: Vec<OutboxEntry>) -> (Vec<PlanItem>, Vec<i64>) {
    let mut items: Vec<Option<PlanItem>> = Vec::new();
    let mut open_inserts: HashMap<String, usize> = HashMap::new();
    let mut annihilated: Vec<i64> = Vec::new();

    for entry in entries {
        match entry.op {
            Operation::Insert => {
                let Some(id) = entry.record_id else {
                    annihilated.push(entry.seq);
                    continue;
                };
                let payload = entry.payload.unwrap_or_else(|| Value::Object(Default::default()));
                if id.is_temporary() {
                    open_inserts.insert(id.to_key(), items.len());
                }
                items.push(Some(PlanItem::Insert(InsertItem {
                    table: entry.table,
                    temp: id,
                    payload,
                    seqs: vec![entry.seq],
                })));
            }
            Operation::Update => {
                let Some(id) = entry.record_id else {
                    annihilated.push(entry.seq);
                    continue;
                };
                if let Some(&idx) = open_inserts.get(&id.to_key()) {
                    if let Some(PlanItem::Insert(insert)) =
                        items.get_mut(idx).and_then(Option::as_mut)
                    {
                        if let (Value::Object(base), Some(Value::Object(patch))) =
                            (&mut insert.payload, &entry.payload)
                        {
                            for (key, value) in patch {
                                base.insert(key.clone(), value.clone());
                            }
                        }
                        insert.seqs.push(entry.seq);
                        continue;
                    }
                }
                items.push(Some(PlanItem::Update {
                    table: entry.table,
                    seq: entry.seq,
                    id,
                    payload: entry.payload.unwrap_or_else(|| Value::Object(Default::default())),
                }));
            }
            Operation::Delete => {
                if let Some(id) = &entry.record_id {
                    if id.is_temporary() {
                        if let Some(idx) = open_inserts.remove(&id.to_key()) {
                            if let Some(PlanItem::Insert(insert)) =
                                items.get_mut(idx).and_then(Option::take)
                            {
                                annihilated.extend(insert.seqs);
                            }
                        }
                        // The record never reached the remote either way.
                        annihilated.push(entry.seq);
                        continue;
                    }
                }
                items.push(Some(PlanItem::Delete {
                    table: entry.table,
                    seq: entry.seq,
                    id: entry.record_id,
                }));
            }
        }
    }

    (items.into_iter().flatten().collect(), annihilated)
}

fn wire_date(row: &Value) -> Option<DateTime<Utc>> {
    row.get("date")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn is_transaction_insert(item: &PlanItem) -> bool {
    matches!(item, PlanItem::Insert(it) if it.table == Table::Transactions)
}

fn references_any(item: &PlanItem, dropped: &HashSet<String>) -> bool {
    if dropped.is_empty() {
        return false;
    }
    let (id, payload) = match item {
        PlanItem::Insert(it) => (Some(&it.temp), Some(&it.payload)),
        PlanItem::Update { id, payload, .. } => (Some(id), Some(payload)),
        PlanItem::Delete { id, .. } => (id.as_ref(), None),
    };
    if let Some(id) = id {
        if dropped.contains(&id.to_key()) {
            return true;
        }
    }
    if let Some(Value::Object(fields)) = payload {
        for value in fields.values() {
            if let Value::String(s) = value {
                if dropped.contains(s.as_str()) {
                    return true;
                }
            }
        }
    }
    false
}

/// Point not-yet-flushed plan items at a freshly assigned permanent id.
/// The durable queue was already rewritten; this keeps the in-memory
/// copy of the pass in step with it.
fn rewrite_plan(items: &mut [PlanItem], old: &RecordId, new: &RecordId) {
    let old_json = old.to_json();
    for item in items {
        let (id, payload) = match item {
            PlanItem::Insert(it) => (Some(&mut it.temp), Some(&mut it.payload)),
            PlanItem::Update { id, payload, .. } => (Some(id), Some(payload)),
            PlanItem::Delete { id, .. } => (id.as_mut(), None),
        };
        if let Some(id) = id {
            if id == old {
                *id = new.clone();
            }
        }
        if let Some(Value::Object(fields)) = payload {
            for value in fields.values_mut() {
                if *value == old_json {
                    *value = new.to_json();
                }
            }
        }
    }
}
