//! The permission envelope a plan is validated and executed against.

use std::path::PathBuf;

/// Allow-listed roots and resource caps a plan must stay within.
///
/// Built by `coworker-runtime::config` from configuration plus per-task
/// metadata; consumed by `coworker-core::policy` and the executor.
#[derive(Debug, Clone)]
pub struct Policy {
    pub allowed_roots: Vec<PathBuf>,
    pub max_read_bytes: u64,
    pub max_write_bytes: u64,
    pub max_web_bytes: u64,
    pub max_query_chars: usize,
    pub require_approval: bool,
    pub web_enabled: bool,
    pub web_allowlist: Vec<String>,
}

impl Policy {
    /// Defaults recovered from the original implementation's `policy_from_config`.
    #[must_use]
    pub fn with_roots(allowed_roots: Vec<PathBuf>) -> Self {
        Self {
            allowed_roots,
            max_read_bytes: 200_000,
            max_write_bytes: 200_000,
            max_web_bytes: 200_000,
            max_query_chars: 256,
            require_approval: true,
            web_enabled: false,
            web_allowlist: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_within_roots(&self, path: &std::path::Path) -> bool {
        self.allowed_roots
            .iter()
            .any(|root| path.starts_with(root))
    }
}
