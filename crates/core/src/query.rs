//! Cursor-paged transaction views over the local cache and the remote.
//!
//! The first page always comes from the cache. Older history is pulled
//! with a keyset cursor and merged in, so scrolling works the same
//! whether the rows were already local or not. A fingerprint of the
//! working set keeps refreshes cheap: recomputation only happens when
//! the dataset or the filter actually changed.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::errors::Result;
use crate::model::{from_wire_row, RecordId, Transaction, TransactionType};
use crate::runtime::{Clock, Connectivity};
use crate::sync::{DateBounds, PageCursor, RemoteStore};

pub const PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeFilter {
    All,
    /// Both transfer legs live on one row, so this is a single variant.
    Transfers,
    /// Loan disbursements, receipts and repayments together.
    Loans,
    Only(TransactionType),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFilter {
    All,
    Today,
    ThisWeek,
    ThisMonth,
    LastThreeMonths,
    LastSixMonths,
    ThisYear,
    Custom {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOptions {
    pub type_filter: TypeFilter,
    /// Category for expenses, income source for incomes. Other types
    /// always pass.
    pub category_filter: Option<RecordId>,
    /// Matches either leg of a transfer.
    pub account_filter: Option<RecordId>,
    pub date_filter: DateFilter,
    /// Case-insensitive match against the comment.
    pub search: Option<String>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            type_filter: TypeFilter::All,
            category_filter: None,
            account_filter: None,
            date_filter: DateFilter::All,
            search: None,
        }
    }
}

impl FilterOptions {
    fn matches(&self, tx: &Transaction, range: &(Option<DateTime<Utc>>, Option<DateTime<Utc>>)) -> bool {
        match &self.type_filter {
            TypeFilter::All => {}
            TypeFilter::Transfers => {
                if tx.kind != TransactionType::Transfer {
                    return false;
                }
            }
            TypeFilter::Loans => {
                if !matches!(
                    tx.kind,
                    TransactionType::LoanGiven
                        | TransactionType::LoanReceived
                        | TransactionType::LoanPayment
                ) {
                    return false;
                }
            }
            TypeFilter::Only(kind) => {
                if tx.kind != *kind {
                    return false;
                }
            }
        }

        if let Some(wanted) = &self.category_filter {
            if tx.kind == TransactionType::Expense && tx.category_id.as_ref() != Some(wanted) {
                return false;
            }
            if tx.kind == TransactionType::Income && tx.income_source_id.as_ref() != Some(wanted) {
                return false;
            }
        }

        if let Some(account) = &self.account_filter {
            let hit = tx.account_id.as_ref() == Some(account)
                || tx.to_account_id.as_ref() == Some(account);
            if !hit {
                return false;
            }
        }

        let (from, to) = range;
        if let Some(from) = from {
            if tx.date < *from {
                return false;
            }
        }
        if let Some(to) = to {
            if tx.date >= *to {
                return false;
            }
        }

        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            let hit = tx
                .comment
                .as_deref()
                .map(|c| c.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !hit {
                return false;
            }
        }
        true
    }

    /// Inclusive lower and exclusive upper datetime bound of the filter.
    fn date_range(&self, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let today = now.date_naive();
        let start_of = |date: NaiveDate| date.and_time(NaiveTime::MIN).and_utc();
        match &self.date_filter {
            DateFilter::All => (None, None),
            DateFilter::Today => (Some(start_of(today)), None),
            DateFilter::ThisWeek => (Some(start_of(today.week(Weekday::Mon).first_day())), None),
            DateFilter::ThisMonth => (
                today.with_day(1).map(start_of),
                None,
            ),
            DateFilter::LastThreeMonths => (
                Some(start_of(today.checked_sub_months(Months::new(3)).unwrap_or(today))),
                None,
            ),
            DateFilter::LastSixMonths => (
                Some(start_of(today.checked_sub_months(Months::new(6)).unwrap_or(today))),
                None,
            ),
            DateFilter::ThisYear => (
                NaiveDate::from_ymd_opt(today.year(), 1, 1).map(start_of),
                None,
            ),
            DateFilter::Custom { from, to } => (
                from.map(start_of),
                to.and_then(|d| d.succ_opt()).map(start_of),
            ),
        }
    }
}

/// Inflows and outflows of the currently loaded working set, in the
/// user's main currency where a conversion is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    pub inflows: Decimal,
    pub outflows: Decimal,
    pub net: Decimal,
}

impl Default for PeriodSummary {
    fn default() -> Self {
        Self {
            inflows: Decimal::ZERO,
            outflows: Decimal::ZERO,
            net: Decimal::ZERO,
        }
    }
}

fn summarize(rows: &[Transaction]) -> PeriodSummary {
    let mut inflows = Decimal::ZERO;
    let mut outflows = Decimal::ZERO;
    for tx in rows {
        let amount = tx.main_currency_amount.unwrap_or(tx.amount);
        match tx.kind {
            TransactionType::Income | TransactionType::LoanReceived => inflows += amount,
            TransactionType::Expense | TransactionType::LoanGiven => outflows += amount,
            _ => {}
        }
    }
    PeriodSummary {
        inflows,
        outflows,
        net: inflows - outflows,
    }
}

/// Newest first: calendar day, then creation time, then id. Rows still
/// waiting for a permanent id sort ahead of acknowledged peers, newest
/// uuid key first, so the order stays total for the sort.
pub fn compare_newest_first(a: &Transaction, b: &Transaction) -> CmpOrdering {
    b.date
        .date_naive()
        .cmp(&a.date.date_naive())
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| match (&a.id, &b.id) {
            (RecordId::Permanent(x), RecordId::Permanent(y)) => y.cmp(x),
            (RecordId::Temporary(x), RecordId::Temporary(y)) => y.cmp(x),
            (RecordId::Temporary(_), RecordId::Permanent(_)) => CmpOrdering::Less,
            (RecordId::Permanent(_), RecordId::Temporary(_)) => CmpOrdering::Greater,
        })
}

/// Cheap change detector over a dataset: row count, boundary ids and a
/// rolling hash of every id in order.
pub fn dataset_fingerprint(rows: &[Transaction]) -> String {
    let first = rows.first().map(|t| t.id.to_key()).unwrap_or_default();
    let last = rows.last().map(|t| t.id.to_key()).unwrap_or_default();
    let mut hash: i32 = 0;
    for (i, tx) in rows.iter().enumerate() {
        if i > 0 {
            hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(',' as i32);
        }
        for ch in tx.id.to_key().chars() {
            hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(ch as i32);
        }
    }
    format!("{}:{}:{}:{}", rows.len(), first, last, hash)
}

pub struct PaginatedQuery {
    filter: FilterOptions,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
    /// Bumped whenever the view is rebuilt; an in-flight page fetch that
    /// observes a newer generation discards its result.
    generation: Arc<AtomicU64>,
    rows: Vec<Transaction>,
    summary: PeriodSummary,
    cursor: Option<PageCursor>,
    has_more: bool,
    loaded_key: Option<String>,
}

impl PaginatedQuery {
    pub fn new(
        filter: FilterOptions,
        clock: Arc<dyn Clock>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self {
            filter,
            clock,
            connectivity,
            generation: Arc::new(AtomicU64::new(0)),
            rows: Vec::new(),
            summary: PeriodSummary::default(),
            cursor: None,
            has_more: false,
            loaded_key: None,
        }
    }

    pub fn filter(&self) -> &FilterOptions {
        &self.filter
    }

    pub fn set_filter(&mut self, filter: FilterOptions) {
        if filter != self.filter {
            self.filter = filter;
            self.loaded_key = None;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn rows(&self) -> &[Transaction] {
        &self.rows
    }

    pub fn summary(&self) -> PeriodSummary {
        self.summary
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Rebuild the view from the cached transactions. Returns `false`
    /// without touching anything when neither the dataset fingerprint
    /// nor the filter changed since the last rebuild.
    pub fn refresh(&mut self, local: &[Transaction]) -> Result<bool> {
        let key = format!(
            "{}|{}",
            serde_json::to_string(&self.filter)?,
            dataset_fingerprint(local)
        );
        if self.loaded_key.as_deref() == Some(key.as_str()) {
            return Ok(false);
        }

        let range = self.filter.date_range(self.clock.now());
        let mut rows: Vec<Transaction> = local
            .iter()
            .filter(|tx| self.filter.matches(tx, &range))
            .cloned()
            .collect();
        rows.sort_by(compare_newest_first);

        self.cursor = oldest_cursor(&rows);
        self.has_more = rows.len() >= PAGE_SIZE && self.cursor.is_some();
        self.summary = summarize(&rows);
        self.rows = rows;
        self.loaded_key = Some(key);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Fetch the next page of older transactions from the remote and
    /// merge it into the working set. Returns how many rows were added.
    pub async fn load_more(&mut self, remote: &dyn RemoteStore) -> Result<usize> {
        if !self.has_more || !self.connectivity.is_online() {
            return Ok(0);
        }
        let Some(cursor) = self.cursor else {
            self.has_more = false;
            return Ok(0);
        };

        let generation = self.generation.load(Ordering::SeqCst);
        let (from, to) = self.filter.date_range(self.clock.now());
        let fetched = remote
            .transactions_before(Some(cursor), DateBounds { from, to }, PAGE_SIZE)
            .await?;
        if self.generation.load(Ordering::SeqCst) != generation {
            // the view was rebuilt while the page was in flight
            return Ok(0);
        }

        let raw_count = fetched.len();
        let mut page: Vec<Transaction> = Vec::with_capacity(raw_count);
        for row in &fetched {
            page.push(serde_json::from_value(from_wire_row(row))?);
        }
        page.sort_by(compare_newest_first);

        if let Some(next) = oldest_cursor(&page) {
            self.cursor = Some(next);
        }

        let range = self.filter.date_range(self.clock.now());
        let known: HashSet<String> = self.rows.iter().map(|t| t.id.to_key()).collect();
        let mut added = 0;
        for tx in page {
            if known.contains(&tx.id.to_key()) || !self.filter.matches(&tx, &range) {
                continue;
            }
            self.rows.push(tx);
            added += 1;
        }
        self.rows.sort_by(compare_newest_first);
        self.summary = summarize(&self.rows);
        if raw_count < PAGE_SIZE {
            self.has_more = false;
        }
        Ok(added)
    }
}

// Oldest row that the remote can anchor a keyset on. Rows still waiting
// for their permanent id cannot page, so the nearest permanent neighbor
// anchors instead.
fn oldest_cursor(rows: &[Transaction]) -> Option<PageCursor> {
    rows.iter().rev().find_map(|tx| {
        tx.id.as_permanent().map(|id| PageCursor { date: tx.date, id })
    })
}
