//! Error taxonomy shared between the executor and its callers.
//!
//! Tool-primitive errors ([`crate` callers use `coworker_tools::ToolError`])
//! and store/lock errors live next to the IO that produces them; these two
//! variants are the ones the executor itself raises and the daemon branches
//! on (§7 / §4.14 of the design).

use thiserror::Error;

/// A structural or policy violation: fatal to the current task attempt.
#[derive(Debug, Error)]
#[error("plan validation failed: {}", .0.join("; "))]
pub struct PlanError(pub Vec<String>);

/// Raised by the executor when it cannot proceed without more approval.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("plan validation failed: {}", .0.join("; "))]
    PlanValidation(Vec<String>),

    #[error("approval required for plan_hash={plan_hash} checkpoint_id={checkpoint_id:?}")]
    Approval {
        plan_hash: String,
        checkpoint_id: Option<String>,
    },

    #[error("tool call '{call_id}' failed: {message}")]
    ToolFailure { call_id: String, message: String },
}
