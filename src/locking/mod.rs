//! Single-writer locking for resolution runs.

mod database_lock;

pub use database_lock::{DatabaseLock, LockInfo, cleanup_all_locks};
