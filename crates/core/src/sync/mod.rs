//! Remote replication: the store trait the engine drains into, and the
//! engine itself.

mod engine;
mod remote;

pub use engine::{SyncEngine, SyncState, SyncStatus};
pub use remote::{DateBounds, PageCursor, RemoteStore};
