//! Plan validation, canonical hashing, and execution for the coworker task runtime.
//!
//! This crate owns the parts of the system that are pure logic over
//! [`coworker_types`] plus dispatch to [`coworker_tools`] primitives: no SQLite,
//! no daemon loop, no CLI. Those live in `coworker-store` and `coworker-runtime`.

pub mod executor;
pub mod plan;
pub mod policy;
pub mod registry;

use thiserror::Error;

/// Errors raised while parsing or structurally validating a plan.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid plan json: {0}")]
    InvalidJson(String),

    #[error("unsupported plan version: {0}")]
    UnsupportedVersion(u32),

    #[error("tool call {0}: {1}")]
    BadToolCall(usize, String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<CoreError> for Vec<String> {
    fn from(err: CoreError) -> Self {
        vec![err.to_string()]
    }
}
