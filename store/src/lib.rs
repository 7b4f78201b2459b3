//! Durable task storage for the coworker runtime.
//!
//! - `task_store`: SQLite-backed task/approval records (schema, claims,
//!   partial updates).
//! - `task_bundle`: the per-task on-disk directory (`plan.json`, `task.json`,
//!   `preview.txt`, `events.jsonl`).
//! - `locks`: advisory per-path locking so two tasks can't touch overlapping
//!   filesystem subtrees concurrently.
//! - `sqlite_util`: the secure-storage and timestamp helpers shared by the
//!   above.

pub mod error;
pub mod locks;
mod sqlite_util;
pub mod task_bundle;
pub mod task_store;

pub use error::{LockError, StoreError};
pub use locks::{LockHandle, acquire_locks, release_task_locks};
pub use task_bundle::{BundlePaths, append_event, ensure_task_bundle, init_task_bundle, read_events, update_task_snapshot};
pub use task_store::{ApprovalRow, ColumnUpdate, TaskStore, TaskUpdate};
