//! Thin resolution layer over [`coworker_types::ToolName`].
//!
//! The tagged enum already carries category/approval-class; this module just
//! gives the executor and policy checker a single `resolve` call that turns a
//! plan's raw `tool` string into either a known [`ToolName`] or a structured
//! "unrecognized tool" validation error, matching the original registry's
//! `lookup` behavior of refusing unknown names outright rather than guessing.

use coworker_types::ToolName;

/// Resolve a plan's `tool` string to a known tool, or `None` if unrecognized.
#[must_use]
pub fn resolve(name: &str) -> Option<ToolName> {
    ToolName::parse(name)
}

/// All tool names the runtime recognizes, in registry order.
#[must_use]
pub fn known_tool_names() -> Vec<&'static str> {
    ToolName::ALL.iter().map(|t| t.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_tools() {
        assert_eq!(resolve("fs.read_text"), Some(ToolName::FsReadText));
        assert_eq!(resolve("web.fetch"), Some(ToolName::WebFetch));
    }

    #[test]
    fn unknown_tool_resolves_to_none() {
        assert_eq!(resolve("fs.delete_everything"), None);
    }

    #[test]
    fn known_tool_names_has_eight_entries() {
        assert_eq!(known_tool_names().len(), 8);
    }
}
