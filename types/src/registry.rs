//! The closed set of tools the runtime knows how to execute.
//!
//! Recovered from `coworker/registry.py`: a fixed table of eight tools, each
//! carrying a category and an approval class. Represented here as a tagged
//! enum rather than a runtime string map — `ToolName::parse` is the one place
//! an unrecognized string surfaces as an error; everywhere else is a `match`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    FsReadText,
    FsListDir,
    FsProposeWriteFile,
    FsApplyWriteFile,
    FsMove,
    FsRename,
    DocExtractPdfText,
    WebFetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    Read,
    Write,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalClass {
    Low,
    High,
}

impl ToolName {
    pub const ALL: [ToolName; 8] = [
        ToolName::FsReadText,
        ToolName::FsListDir,
        ToolName::FsProposeWriteFile,
        ToolName::FsApplyWriteFile,
        ToolName::FsMove,
        ToolName::FsRename,
        ToolName::DocExtractPdfText,
        ToolName::WebFetch,
    ];

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "fs.read_text" => Self::FsReadText,
            "fs.list_dir" => Self::FsListDir,
            "fs.propose_write_file" => Self::FsProposeWriteFile,
            "fs.apply_write_file" => Self::FsApplyWriteFile,
            "fs.move" => Self::FsMove,
            "fs.rename" => Self::FsRename,
            "doc.extract_pdf_text" => Self::DocExtractPdfText,
            "web.fetch" => Self::WebFetch,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FsReadText => "fs.read_text",
            Self::FsListDir => "fs.list_dir",
            Self::FsProposeWriteFile => "fs.propose_write_file",
            Self::FsApplyWriteFile => "fs.apply_write_file",
            Self::FsMove => "fs.move",
            Self::FsRename => "fs.rename",
            Self::DocExtractPdfText => "doc.extract_pdf_text",
            Self::WebFetch => "web.fetch",
        }
    }

    #[must_use]
    pub const fn category(self) -> ToolCategory {
        match self {
            Self::FsReadText | Self::FsListDir | Self::DocExtractPdfText => ToolCategory::Read,
            Self::FsProposeWriteFile | Self::FsApplyWriteFile | Self::FsMove | Self::FsRename => {
                ToolCategory::Write
            }
            Self::WebFetch => ToolCategory::Network,
        }
    }

    #[must_use]
    pub const fn approval_class(self) -> ApprovalClass {
        match self {
            Self::FsReadText | Self::FsListDir | Self::DocExtractPdfText | Self::FsProposeWriteFile => {
                ApprovalClass::Low
            }
            Self::FsApplyWriteFile | Self::FsMove | Self::FsRename | Self::WebFetch => {
                ApprovalClass::High
            }
        }
    }

    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self.category(), ToolCategory::Write) && !matches!(self, Self::FsProposeWriteFile)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_tool_name() {
        for tool in ToolName::ALL {
            assert_eq!(ToolName::parse(tool.as_str()), Some(tool));
        }
    }

    #[test]
    fn rejects_unknown_tool() {
        assert_eq!(ToolName::parse("fs.delete"), None);
    }

    #[test]
    fn write_class_excludes_propose_write() {
        assert!(!ToolName::FsProposeWriteFile.is_write());
        assert!(ToolName::FsApplyWriteFile.is_write());
        assert!(ToolName::FsMove.is_write());
        assert!(ToolName::FsRename.is_write());
    }
}
