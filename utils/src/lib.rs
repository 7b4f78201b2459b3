//! Shared infrastructure utilities for the coworker runtime.
//!
//! - **`atomic_write`**: crash-safe file persistence (temp + rename), including a
//!   no-clobber variant used by `fs.apply_write_file`.
//! - **`diff`**: unified diff formatting and stats, used by `fs.propose_write_file`
//!   and the executor's diff-annotated preview.

pub mod atomic_write;
pub mod diff;

pub use atomic_write::{
    AtomicWriteOptions, FileSyncPolicy, ParentDirSyncPolicy, PersistMode, atomic_write,
    atomic_write_new_with_options, atomic_write_with_options, recover_bak_file,
};
pub use diff::{compute_diff_stats, format_unified_diff, format_unified_diff_width};
