//! Core domain types for the coworker task runtime — no IO, no async.
//!
//! A [`Plan`] is the unit of work: an ordered list of [`ToolCall`]s plus optional
//! checkpoints. Everything here is pure data and pure functions over that data;
//! filesystem, network, and SQLite access live in `coworker-tools` and
//! `coworker-store`.

pub mod error;
pub mod plan;
pub mod policy;
pub mod registry;
pub mod task;

pub use error::{ExecError, PlanError};
pub use plan::{Plan, ToolCall};
pub use policy::Policy;
pub use registry::{ApprovalClass, ToolCategory, ToolName};
pub use task::{ApprovalRecord, ResumeState, TaskRecord, TaskState};
