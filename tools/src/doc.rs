//! `doc.extract_pdf_text`: PDF text extraction.
//!
//! Narrow seam, not a full implementation: the original runtime shells out to
//! an OCR-capable extractor keyed by `ocr_mode`. Wiring a PDF/OCR backend in
//! is out of scope here; this keeps the tool resolvable and policy-checkable
//! while returning a typed error instead of silently producing empty text.

use std::path::Path;

use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcrMode {
    Off,
    Ask,
    On,
}

impl OcrMode {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "off" => Self::Off,
            "ask" => Self::Ask,
            "on" => Self::On,
            _ => return None,
        })
    }
}

/// Extraction is not implemented; callers see a typed `ToolError` rather than
/// a panic or placeholder text.
pub fn extract_pdf_text(path: &Path, _max_chars: Option<usize>, _ocr_mode: OcrMode) -> Result<String, ToolError> {
    if !path.is_file() {
        return Err(ToolError::NotFound(path.display().to_string()));
    }
    Err(ToolError::InvalidArgs(
        "doc.extract_pdf_text is not implemented in this runtime".to_string(),
    ))
}
