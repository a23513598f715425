//! Local-first personal finance store with background replication.
//!
//! Reads are always served from the durable local cache. Writes land
//! locally first, queue themselves in the outbox, and a sync engine
//! replays the queue against the remote REST store whenever the device
//! is online, swapping client-assigned temporary ids for the permanent
//! ones the remote hands back.

pub mod cache;
pub mod errors;
pub mod ledger;
pub mod model;
pub mod outbox;
pub mod query;
pub mod runtime;
pub mod sync;

pub use cache::{LocalCache, TRANSACTION_CACHE_LIMIT};
pub use errors::{Error, Result};
pub use outbox::{Operation, Outbox, OutboxEntry};
pub use query::{DateFilter, FilterOptions, PaginatedQuery, PeriodSummary, TypeFilter, PAGE_SIZE};
pub use sync::{RemoteStore, SyncEngine, SyncState, SyncStatus};
